//! Register port abstraction for the OTG core
//!
//! The transfer engine addresses the core only through byte offsets on a
//! [`RegisterPort`]. [`MmioPort`] is the hardware implementation with the
//! barrier ordering the Cortex-M weakly-ordered memory model needs; tests and
//! simulators provide their own port.

use core::ptr::{read_volatile, write_volatile};

use embedded_hal::delay::DelayNs;

use crate::error::{Result, UsbError};

/// Opaque read/write access to the controller's registers
pub trait RegisterPort {
    /// Read the 32-bit register at `offset`
    fn read(&mut self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`
    fn write(&mut self, offset: usize, value: u32);

    /// Read-modify-write
    #[inline(always)]
    fn modify<F>(&mut self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let current = self.read(offset);
        self.write(offset, f(current));
    }

    /// Set bits
    #[inline(always)]
    fn set_bits(&mut self, offset: usize, mask: u32) {
        self.modify(offset, |v| v | mask);
    }

    /// Clear bits
    #[inline(always)]
    fn clear_bits(&mut self, offset: usize, mask: u32) {
        self.modify(offset, |v| v & !mask);
    }

    /// Drain `buf.len()` bytes of the packet at the head of the shared RX FIFO
    fn read_fifo(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(4) {
            let word = self.read(super::dfifo(0)).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Push one packet into a channel's transmit FIFO window
    fn write_fifo(&mut self, channel: usize, data: &[u8]) {
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write(super::dfifo(channel), u32::from_le_bytes(word));
        }
    }
}

/// Memory-mapped register port
pub struct MmioPort {
    base: usize,
}

impl MmioPort {
    /// Create a port over the core's register window
    ///
    /// # Safety
    ///
    /// `base` must be the address of a DWC OTG register block that stays
    /// mapped for the lifetime of the port, and the caller must ensure nothing
    /// else drives the core concurrently.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address of the register window
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl RegisterPort for MmioPort {
    #[inline(always)]
    fn read(&mut self, offset: usize) -> u32 {
        let addr = (self.base + offset) as *const u32;
        // Safety: base was validated by the caller of `new`, offsets come from the register map
        unsafe {
            cortex_m::asm::dmb();
            let value = read_volatile(addr);
            cortex_m::asm::dmb();
            value
        }
    }

    #[inline(always)]
    fn write(&mut self, offset: usize, value: u32) {
        let addr = (self.base + offset) as *mut u32;
        // Safety: see `read`
        unsafe {
            cortex_m::asm::dmb();
            write_volatile(addr, value);
            cortex_m::asm::dsb();
        }
    }
}

/// Bounded polling for self-clearing register bits
///
/// Counts polls instead of CPU cycles so the bound holds on any core clock.
pub struct RegisterTimeout {
    budget: u32,
    interval_us: u32,
}

impl RegisterTimeout {
    /// Poll at most `budget` times, `interval_us` apart
    pub const fn new(budget: u32, interval_us: u32) -> Self {
        Self { budget, interval_us }
    }

    /// Total time the wait may take in microseconds
    pub const fn duration_us(&self) -> u32 {
        self.budget.saturating_mul(self.interval_us)
    }

    /// Wait until `condition` holds on the register at `offset`
    pub fn wait_for<P, D, F>(&self, port: &mut P, delay: &mut D, offset: usize, mut condition: F) -> Result<()>
    where
        P: RegisterPort,
        D: DelayNs,
        F: FnMut(u32) -> bool,
    {
        for _ in 0..self.budget {
            if condition(port.read(offset)) {
                return Ok(());
            }
            delay.delay_us(self.interval_us);
        }
        if condition(port.read(offset)) {
            Ok(())
        } else {
            Err(UsbError::ResetTimeout)
        }
    }
}
