//! Host channel table and allocator
//!
//! Each hardware channel runs one packet-level transaction at a time. A
//! descriptor claims a channel before its first protocol step and gives it
//! back when it terminates. A channel disabled while still enabled in hardware
//! is held back from reuse for two frame boundaries (`wait_sof`).

use crate::descriptor::Descriptor;
use crate::fifo::FifoEngine;
use crate::otg::{self, HcChar, HcInt, RegisterPort, MAX_HOST_CHANNELS};

/// SOF boundaries a disabled channel must see before reuse
pub const DISABLE_WAIT_SOF: u8 = 2;

/// State of one hardware channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channel {
    /// Claimed by a descriptor
    pub allocated: bool,
    /// Owning transfer is suspended, no new packets may be issued
    pub suspended: bool,
    /// Frames left before the channel may be claimed again
    pub wait_sof: u8,
    /// Interrupt conditions latched since last consumed
    pub hcint: HcInt,
}

impl Channel {
    const IDLE: Self = Self {
        allocated: false,
        suspended: false,
        wait_sof: 0,
        hcint: HcInt::empty(),
    };

    /// Check if the channel can be claimed
    #[inline(always)]
    pub const fn is_free(&self) -> bool {
        !self.allocated && self.wait_sof == 0
    }
}

/// Fixed table of host channels
pub struct ChannelTable {
    channels: [Channel; MAX_HOST_CHANNELS],
    count: usize,
    /// Channels whose received packets are routed to a descriptor
    rx_routing: u16,
}

impl ChannelTable {
    /// Create table for `count` hardware channels (clamped to the hardware maximum)
    pub const fn new(count: usize) -> Self {
        let count = if count > MAX_HOST_CHANNELS { MAX_HOST_CHANNELS } else { count };
        Self {
            channels: [Channel::IDLE; MAX_HOST_CHANNELS],
            count,
            rx_routing: 0,
        }
    }

    /// Number of usable channels
    #[inline(always)]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Channel state
    pub fn get(&self, ch: usize) -> Option<&Channel> {
        self.channels[..self.count].get(ch)
    }

    /// Bit mask of channels whose RX packets should be delivered
    #[inline(always)]
    pub const fn rx_routing(&self) -> u16 {
        self.rx_routing
    }

    /// Number of channels currently claimed
    pub fn allocated_count(&self) -> usize {
        self.channels[..self.count].iter().filter(|c| c.allocated).count()
    }

    /// Check if any channel is counting down frames
    pub fn needs_sof(&self) -> bool {
        self.channels[..self.count].iter().any(|c| c.wait_sof != 0)
    }

    /// Accumulate interrupt conditions read from HCINTn
    #[inline(always)]
    pub fn latch(&mut self, ch: usize, bits: HcInt) {
        if let Some(c) = self.channels[..self.count].get_mut(ch) {
            c.hcint |= bits;
        }
    }

    /// Latched conditions for a channel
    #[inline(always)]
    pub fn hcint(&self, ch: usize) -> HcInt {
        self.get(ch).map(|c| c.hcint).unwrap_or_else(HcInt::empty)
    }

    /// Discard latched conditions for a channel
    #[inline(always)]
    pub fn clear_hcint(&mut self, ch: usize) {
        if let Some(c) = self.channels[..self.count].get_mut(ch) {
            c.hcint = HcInt::empty();
        }
    }

    /// Claim a channel for `td`
    ///
    /// Endpoint-zero traffic is confined to channel 0; everything else
    /// competes for channels 1 and up. Returns `false` when nothing is free.
    pub fn acquire(&mut self, fifo: &mut FifoEngine, td: &mut Descriptor) -> bool {
        if td.channel.is_some() {
            return true;
        }
        let (first, last) = if td.endpoint_number() == 0 { (0, 1) } else { (1, self.count) };

        for ch in first..last.min(self.count) {
            if !self.channels[ch].is_free() {
                continue;
            }
            let c = &mut self.channels[ch];
            c.allocated = true;
            c.hcint = HcInt::empty();

            // A packet still latched for this channel belongs to its previous owner
            if fifo.ack_channel(ch) {
                #[cfg(feature = "defmt")]
                defmt::debug!("CH{}: dropped stale rx packet on acquire", ch);
            }
            self.rx_routing |= 1 << ch;
            td.channel = Some(ch as u8);

            #[cfg(feature = "defmt")]
            defmt::trace!("CH{}: acquired", ch);
            return true;
        }
        false
    }

    /// Request the hardware to stop a channel that is still enabled
    ///
    /// Returns `true` when a disable was issued and the channel now waits out
    /// `DISABLE_WAIT_SOF` frames.
    pub fn disable<P: RegisterPort>(&mut self, port: &mut P, ch: usize) -> bool {
        if ch >= self.count {
            return false;
        }
        let hcchar = HcChar::from_bits_retain(port.read(otg::hcchar(ch)));
        if hcchar.intersects(HcChar::CHENA | HcChar::CHDIS) {
            port.write(otg::hcchar(ch), (HcChar::CHENA | HcChar::CHDIS).bits());
            self.channels[ch].wait_sof = DISABLE_WAIT_SOF;
            return true;
        }
        false
    }

    /// Give `td`'s channel back to the pool
    ///
    /// Returns `true` when the channel was still active and now needs SOF
    /// interrupts to count down its reuse delay.
    pub fn release<P: RegisterPort>(&mut self, port: &mut P, fifo: &mut FifoEngine, td: &mut Descriptor) -> bool {
        let Some(ch) = td.channel.take() else {
            return false;
        };
        let ch = ch as usize;
        let needs_sof = self.disable(port, ch);

        let c = &mut self.channels[ch];
        c.allocated = false;
        c.suspended = false;
        c.hcint = HcInt::empty();
        fifo.ack_channel(ch);
        self.rx_routing &= !(1 << ch);

        #[cfg(feature = "defmt")]
        defmt::trace!("CH{}: released wait_sof={}", ch, c.wait_sof);
        needs_sof
    }

    /// Make `td`'s channel ready for the next packet
    ///
    /// If the channel was disabled and is still waiting out frames, the
    /// descriptor migrates to another free channel so it does not block on
    /// the old one. Endpoint-zero and periodic traffic never migrates and
    /// waits.
    pub fn reassign_on_retry(&mut self, fifo: &mut FifoEngine, td: &mut Descriptor) -> bool {
        let Some(old) = td.channel else {
            return false;
        };
        let old = old as usize;
        if self.channels[old].wait_sof == 0 {
            self.channels[old].hcint = HcInt::empty();
            return true;
        }
        if old == 0 || td.ep_type.is_periodic() {
            return false;
        }

        for ch in 1..self.count {
            if !self.channels[ch].is_free() {
                continue;
            }
            let suspended = self.channels[old].suspended;
            self.channels[old].allocated = false;
            self.channels[old].suspended = false;
            self.channels[old].hcint = HcInt::empty();
            fifo.ack_channel(old);
            self.rx_routing &= !(1 << old);

            let c = &mut self.channels[ch];
            c.allocated = true;
            c.suspended = suspended;
            c.hcint = HcInt::empty();
            self.rx_routing |= 1 << ch;
            td.channel = Some(ch as u8);

            #[cfg(feature = "defmt")]
            defmt::debug!("CH{}: migrated to CH{}", old, ch);
            return true;
        }
        false
    }

    /// Count down reuse delays at a frame boundary
    ///
    /// Returns `true` while any channel still needs further SOF ticks.
    pub fn sof_tick(&mut self) -> bool {
        let mut pending = false;
        for c in self.channels[..self.count].iter_mut() {
            if c.wait_sof != 0 {
                c.wait_sof -= 1;
                pending |= c.wait_sof != 0;
            }
        }
        pending
    }

    /// Mark every claimed channel suspended or resumed
    pub fn set_suspended(&mut self, suspended: bool) {
        for c in self.channels[..self.count].iter_mut().filter(|c| c.allocated) {
            c.suspended = suspended;
        }
    }

    /// Check if a channel is suspended
    #[inline(always)]
    pub fn is_suspended(&self, ch: usize) -> bool {
        self.get(ch).map(|c| c.suspended).unwrap_or(false)
    }
}
