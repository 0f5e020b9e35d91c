//! Pacing timer
//!
//! A periodic tick drives three things: the global pacing value periodic
//! endpoints are scheduled against, the per-descriptor NAK throttle, and
//! transfer deadlines. The platform calls [`UsbHost::timer_tick`] every
//! [`Timer::period_ms`] while [`Timer::is_running`] reports true.
//!
//! [`UsbHost::timer_tick`]: crate::host::UsbHost::timer_tick

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Pacing counter and run state, readable without any lock
pub struct Timer {
    tmr_val: AtomicU8,
    running: AtomicBool,
    period_ms: u32,
}

impl Timer {
    /// Create a stopped timer ticking every `period_ms`
    pub const fn new(period_ms: u32) -> Self {
        Self {
            tmr_val: AtomicU8::new(0),
            running: AtomicBool::new(false),
            period_ms,
        }
    }

    /// Tick period in milliseconds
    #[inline(always)]
    pub const fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Current pacing value
    #[inline(always)]
    pub fn pacing(&self) -> u8 {
        self.tmr_val.load(Ordering::Acquire)
    }

    /// Advance the pacing value, returning the new one
    pub fn advance(&self) -> u8 {
        self.tmr_val.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Start ticking; returns `true` if the timer was stopped
    pub fn start(&self) -> bool {
        let was_running = self.running.swap(true, Ordering::AcqRel);
        #[cfg(feature = "defmt")]
        if !was_running {
            defmt::trace!("timer started");
        }
        !was_running
    }

    /// Stop ticking
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            #[cfg(feature = "defmt")]
            defmt::trace!("timer stopped");
        }
    }

    /// Check if the platform should keep delivering ticks
    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
