//! RTIC integration
//!
//! Splits host work across RTIC tasks: a short hardware task bound to the
//! OTG interrupt, a software task for the deferred dispatcher pass and
//! completion delivery, and a periodic task driving the pacing timer.
//!
//! The host should live in a shared resource whose lock masks the OTG
//! interrupt, so [`HostInterruptContext::usb_interrupt`] never runs while a
//! software task holds the host's locks.
//!
//! ```ignore
//! #[task(binds = USB_OTG, shared = [usb])]
//! fn usb_otg(mut cx: usb_otg::Context) {
//!     if cx.shared.usb.lock(|ctx| ctx.usb_interrupt()) {
//!         usb_deferred::spawn().ok();
//!     }
//! }
//! ```

use crate::host::UsbHost;
use crate::otg::RegisterPort;
use crate::transfer::Completion;

/// USB host context for RTIC tasks
pub struct HostInterruptContext<'a, P: RegisterPort> {
    host: &'a UsbHost<P>,
}

impl<'a, P: RegisterPort> HostInterruptContext<'a, P> {
    /// Wrap a host for use from RTIC tasks
    pub const fn new(host: &'a UsbHost<P>) -> Self {
        Self { host }
    }

    /// Underlying host
    #[inline(always)]
    pub const fn host(&self) -> &'a UsbHost<P> {
        self.host
    }

    /// High-priority interrupt body
    ///
    /// Returns `true` when the deferred task should be spawned.
    #[inline(never)]
    pub fn usb_interrupt(&self) -> bool {
        self.host.on_interrupt()
    }

    /// Deferred processing: dispatcher pass plus completion delivery
    ///
    /// Returns the number of completions handed to `f`.
    pub fn process_deferred(&self, f: impl FnMut(Completion)) -> usize {
        if self.host.poll_pending() {
            self.host.poll();
        }
        self.host.drain_completions(f)
    }

    /// Periodic timer task body
    ///
    /// Returns the delay in milliseconds until the next tick, or `None` once
    /// the timer stopped and the task should not reschedule itself.
    pub fn timer_task(&self) -> Option<u32> {
        self.host.timer_tick();
        self.host.timer_running().then(|| self.host.timer_period_ms())
    }
}
