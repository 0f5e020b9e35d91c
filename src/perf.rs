//! Performance monitoring and diagnostics
//!
//! Relaxed atomic counters, safe to bump from interrupt and task context.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::transfer::Completion;

/// Performance counters for the transfer engine
pub struct PerfCounters {
    /// Transfers completed, any status
    pub transfers_total: AtomicU32,
    /// Transfers completed successfully
    pub transfers_success: AtomicU32,
    /// Transfers completed with an error, timeout or cancellation
    pub transfers_failed: AtomicU32,
    /// Packets re-issued after NAK or a transaction error
    pub transfer_retries: AtomicU32,
    /// Data bytes moved (saturating)
    pub bytes_transferred: AtomicU32,
    /// Interrupt handler invocations
    pub interrupt_count: AtomicU32,
    /// Dispatcher passes
    pub poll_count: AtomicU32,
    /// Received packets nobody consumed
    pub rx_discards: AtomicU32,
    /// Descriptors that found every channel busy
    pub channel_exhaustion: AtomicU32,
}

impl PerfCounters {
    /// Create new performance counter set
    pub const fn new() -> Self {
        Self {
            transfers_total: AtomicU32::new(0),
            transfers_success: AtomicU32::new(0),
            transfers_failed: AtomicU32::new(0),
            transfer_retries: AtomicU32::new(0),
            bytes_transferred: AtomicU32::new(0),
            interrupt_count: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
            rx_discards: AtomicU32::new(0),
            channel_exhaustion: AtomicU32::new(0),
        }
    }

    /// Record a finished transfer
    pub fn record_completion(&self, completion: &Completion) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        if completion.status.is_success() {
            self.transfers_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        }
        if completion.retries != 0 {
            self.transfer_retries.fetch_add(completion.retries, Ordering::Relaxed);
        }

        // Saturate instead of wrapping
        let _ = self.bytes_transferred.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            current.checked_add(completion.actual_length as u32).or(Some(u32::MAX))
        });
    }

    /// Record an interrupt entry
    #[inline(always)]
    pub fn record_interrupt(&self) {
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatcher pass
    #[inline(always)]
    pub fn record_poll(&self) {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded receive packet
    #[inline(always)]
    pub fn record_rx_discard(&self) {
        self.rx_discards.fetch_add(1, Ordering::Relaxed);
    }

    /// Record failed channel acquisitions
    #[inline(always)]
    pub fn record_channel_exhaustion(&self, count: u32) {
        self.channel_exhaustion.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_success: self.transfers_success.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfer_retries: self.transfer_retries.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            interrupt_count: self.interrupt_count.load(Ordering::Relaxed),
            poll_count: self.poll_count.load(Ordering::Relaxed),
            rx_discards: self.rx_discards.load(Ordering::Relaxed),
            channel_exhaustion: self.channel_exhaustion.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.transfers_total,
            &self.transfers_success,
            &self.transfers_failed,
            &self.transfer_retries,
            &self.bytes_transferred,
            &self.interrupt_count,
            &self.poll_count,
            &self.rx_discards,
            &self.channel_exhaustion,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of performance counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct PerfSnapshot {
    pub transfers_total: u32,
    pub transfers_success: u32,
    pub transfers_failed: u32,
    pub transfer_retries: u32,
    pub bytes_transferred: u32,
    pub interrupt_count: u32,
    pub poll_count: u32,
    pub rx_discards: u32,
    pub channel_exhaustion: u32,
}

impl PerfSnapshot {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f32 {
        if self.transfers_total == 0 {
            return 100.0;
        }
        (self.transfers_success as f32 / self.transfers_total as f32) * 100.0
    }

    /// Average retries per completed transfer
    pub fn retries_per_transfer(&self) -> f32 {
        if self.transfers_total == 0 {
            return 0.0;
        }
        self.transfer_retries as f32 / self.transfers_total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransferStatus, UsbError};
    use crate::transfer::{PipeHandle, TransferHandle};

    fn completion(status: TransferStatus, actual: usize, retries: u32) -> Completion {
        Completion {
            transfer: TransferHandle { index: 0, generation: 0 },
            pipe: PipeHandle { index: 0, generation: 0 },
            status,
            error: None,
            actual_length: actual,
            retries,
        }
    }

    #[test]
    fn test_completion_accounting() {
        let perf = PerfCounters::new();
        perf.record_completion(&completion(TransferStatus::Success, 64, 2));
        perf.record_completion(&completion(TransferStatus::from_error(UsbError::Stalled), 0, 0));
        let s = perf.snapshot();
        assert_eq!(s.transfers_total, 2);
        assert_eq!(s.transfers_success, 1);
        assert_eq!(s.transfers_failed, 1);
        assert_eq!(s.transfer_retries, 2);
        assert_eq!(s.bytes_transferred, 64);
        assert_eq!(s.success_rate(), 50.0);
        assert_eq!(s.retries_per_transfer(), 1.0);
    }

    #[test]
    fn test_bytes_saturate() {
        let perf = PerfCounters::new();
        perf.bytes_transferred.store(u32::MAX - 1, Ordering::Relaxed);
        perf.record_completion(&completion(TransferStatus::Success, 10, 0));
        assert_eq!(perf.snapshot().bytes_transferred, u32::MAX);
    }

    #[test]
    fn test_reset() {
        let perf = PerfCounters::new();
        perf.record_interrupt();
        perf.record_poll();
        perf.record_rx_discard();
        perf.record_channel_exhaustion(3);
        assert_eq!(perf.snapshot().channel_exhaustion, 3);
        perf.reset();
        assert_eq!(perf.snapshot(), PerfCounters::new().snapshot());
    }
}
