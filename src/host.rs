//! USB host context
//!
//! [`UsbHost`] splits its state across two locks. The fine-grained lock
//! guards the [`IrqDomain`] (registers, channels, FIFO) and is the only one
//! the interrupt handler touches, via `try_lock`. The coarse lock guards the
//! [`TransferDomain`] (pipes, slots, descriptors). Completions cross from the
//! dispatcher to the caller through a queue. Lock order is always
//! transfers, then registers, then the completion queue.
//!
//! On a single core, thread-mode calls into the host must run with the USB
//! interrupt masked (an RTIC resource lock does this) so the handler never
//! spins on a lock its own thread holds.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use heapless::Deque;
use spin::Mutex;

use crate::channel::Channel;
use crate::descriptor::PoolStats;
use crate::dispatcher::{self, IrqDomain};
use crate::error::{Result, UsbError};
use crate::otg::controller::{read_port_status, update_frame_interval, write_port_control};
use crate::otg::{HostConfig, Hprt, OtgController, PortStatus, RegisterPort, Running};
use crate::perf::PerfCounters;
use crate::timer::Timer;
use crate::transfer::{
    Completion, EndpointConfig, PipeHandle, TransferDomain, TransferHandle, TransferRequest, TransferState,
    MAX_TRANSFERS,
};

/// USB host transfer engine
pub struct UsbHost<P: RegisterPort> {
    irq: Mutex<IrqDomain<P>>,
    xfers: Mutex<TransferDomain>,
    completions: Mutex<Deque<Completion, MAX_TRANSFERS>>,
    timer: Timer,
    irq_pending: AtomicBool,
    perf: PerfCounters,
    config: HostConfig,
}

impl<P: RegisterPort> UsbHost<P> {
    /// Create the engine on a core that is already running in host mode
    pub fn new(port: P, config: HostConfig, channel_count: usize) -> Self {
        Self {
            irq: Mutex::new(IrqDomain::new(port, channel_count, config.max_error_count)),
            xfers: Mutex::new(TransferDomain::new(config)),
            completions: Mutex::new(Deque::new()),
            timer: Timer::new(config.timer_period_ms),
            irq_pending: AtomicBool::new(false),
            perf: PerfCounters::new(),
            config,
        }
    }

    /// Take over a controller brought up by [`OtgController`]
    pub fn from_controller(controller: OtgController<P, Running>) -> Self {
        let (port, config, channels) = controller.into_parts();
        Self::new(port, config, channels)
    }

    /// Engine configuration
    #[inline(always)]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Performance counters
    #[inline(always)]
    pub const fn perf(&self) -> &PerfCounters {
        &self.perf
    }

    // === Pipes ===

    /// Open a pipe for an endpoint
    pub fn open(&self, config: EndpointConfig) -> Result<PipeHandle> {
        self.xfers.lock().open(config)
    }

    /// Close a pipe; outstanding transfers complete as cancelled
    pub fn close(&self, pipe: PipeHandle) -> Result<()> {
        let mut xfers = self.xfers.lock();
        let mut hw = self.irq.lock();
        xfers.close(pipe, &mut hw, &mut |c| self.push_completion(c))
    }

    /// Reset a pipe's data toggle after CLEAR_FEATURE(ENDPOINT_HALT)
    pub fn clear_halt(&self, pipe: PipeHandle) -> Result<()> {
        self.xfers.lock().clear_halt(pipe)
    }

    /// Data toggle the pipe's next transfer starts with
    pub fn pipe_toggle(&self, pipe: PipeHandle) -> Result<bool> {
        self.xfers.lock().pipe_toggle(pipe)
    }

    // === Transfers ===

    /// Queue a transfer and give it a first dispatcher pass
    pub fn submit(&self, pipe: PipeHandle, request: &TransferRequest<'_>) -> Result<TransferHandle> {
        let handle = self.xfers.lock().submit(pipe, request, self.timer.pacing())?;
        self.timer.start();
        self.poll();
        Ok(handle)
    }

    /// Cancel a transfer
    ///
    /// Completes it with `Cancelled` exactly once; aborting a transfer that
    /// already completed is a no-op.
    pub fn abort(&self, transfer: TransferHandle) -> Result<()> {
        let mut xfers = self.xfers.lock();
        let mut hw = self.irq.lock();
        if let Some(c) = xfers.abort(transfer, &mut hw, UsbError::Cancelled)? {
            self.push_completion(c);
        }
        if !xfers.has_work() {
            self.timer.stop();
        }
        Ok(())
    }

    /// Progress of a transfer
    pub fn status(&self, transfer: TransferHandle) -> Result<TransferState> {
        self.xfers.lock().status(transfer)
    }

    /// Copy IN data of a completed transfer into `buf` and free the transfer
    pub fn reclaim(&self, transfer: TransferHandle, buf: &mut [u8]) -> Result<usize> {
        self.xfers.lock().reclaim(transfer, buf)
    }

    /// Error a completed transfer finished with
    pub fn transfer_error(&self, transfer: TransferHandle) -> Result<Option<UsbError>> {
        self.xfers.lock().error(transfer)
    }

    /// Free a completed transfer without copying its data
    pub fn discard(&self, transfer: TransferHandle) -> Result<()> {
        self.xfers.lock().discard(transfer)
    }

    /// Hand every queued completion to `f`
    pub fn drain_completions(&self, mut f: impl FnMut(Completion)) -> usize {
        let mut n = 0;
        while let Some(c) = self.completions.lock().pop_front() {
            f(c);
            n += 1;
        }
        n
    }

    fn push_completion(&self, completion: Completion) {
        self.perf.record_completion(&completion);
        // A full queue drops the record; the slot still reports the outcome
        if let Err(_dropped) = self.completions.lock().push_back(completion) {
            #[cfg(feature = "defmt")]
            defmt::warn!("completion queue full, xfer {} not reported", _dropped.transfer.index());
        }
    }

    // === Dispatch ===

    /// Run one full dispatcher pass in task context
    ///
    /// Returns the number of transfers that completed.
    pub fn poll(&self) -> usize {
        let mut xfers = self.xfers.lock();
        let mut hw = self.irq.lock();
        self.irq_pending.store(false, Ordering::Release);
        self.perf.record_poll();
        dispatcher::service(&mut hw, &mut xfers, self.timer.pacing(), &self.perf, &mut |c| {
            self.push_completion(c)
        })
    }

    /// Interrupt handler body
    ///
    /// Does the bounded part of the work and marks the engine for a deferred
    /// [`poll`](Self::poll). Returns `true` when a poll is needed.
    pub fn on_interrupt(&self) -> bool {
        self.perf.record_interrupt();
        match self.irq.try_lock() {
            Some(mut hw) => {
                if dispatcher::interrupt(&mut hw) {
                    self.irq_pending.store(true, Ordering::Release);
                }
            }
            None => self.irq_pending.store(true, Ordering::Release),
        }
        self.irq_pending.load(Ordering::Acquire)
    }

    /// Check if the interrupt handler requested a poll
    #[inline(always)]
    pub fn poll_pending(&self) -> bool {
        self.irq_pending.load(Ordering::Acquire)
    }

    /// Timer tick body
    ///
    /// Advances pacing, lifts NAK throttles, expires deadlines and polls.
    /// Stops the timer once nothing is queued.
    pub fn timer_tick(&self) {
        if !self.timer.is_running() {
            return;
        }
        self.timer.advance();
        {
            let mut xfers = self.xfers.lock();
            let mut hw = self.irq.lock();
            xfers.tick(&mut hw, &mut |c| self.push_completion(c));
        }
        self.poll();
        if !self.xfers.lock().has_work() {
            self.timer.stop();
        }
    }

    /// Check if the platform should keep calling [`timer_tick`](Self::timer_tick)
    #[inline(always)]
    pub fn timer_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Tick period the platform should call [`timer_tick`](Self::timer_tick) at
    #[inline(always)]
    pub fn timer_period_ms(&self) -> u32 {
        self.timer.period_ms()
    }

    // === Channels and port ===

    /// Stop issuing new packets on every claimed channel
    pub fn suspend(&self) {
        self.irq.lock().channels.set_suspended(true);
    }

    /// Let suspended channels run again
    pub fn resume(&self) {
        self.irq.lock().channels.set_suspended(false);
        self.poll();
    }

    /// Snapshot of one hardware channel
    pub fn channel(&self, ch: usize) -> Option<Channel> {
        self.irq.lock().channels.get(ch).copied()
    }

    /// Channels currently claimed by descriptors
    pub fn channels_in_use(&self) -> usize {
        self.irq.lock().channels.allocated_count()
    }

    /// Descriptor arena utilization
    pub fn pool_stats(&self) -> PoolStats {
        self.xfers.lock().pool_stats()
    }

    /// Current root port status
    pub fn port_status(&self) -> PortStatus {
        read_port_status(&mut self.irq.lock().port)
    }

    /// Last root port change acknowledged by the dispatcher
    pub fn take_port_change(&self) -> Option<PortStatus> {
        self.irq.lock().take_port_change()
    }

    /// Drive USB reset on the root port
    pub fn port_reset<D: DelayNs>(&self, delay: &mut D) -> PortStatus {
        write_port_control(&mut self.irq.lock().port, |h| h | Hprt::PRTRST);
        delay.delay_ms(50);
        write_port_control(&mut self.irq.lock().port, |h| h.difference(Hprt::PRTRST));
        delay.delay_ms(10);

        let mut hw = self.irq.lock();
        let status = read_port_status(&mut hw.port);
        update_frame_interval(&mut hw.port, status.speed);
        status
    }

    /// Direct register access under the register lock
    pub fn with_port<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.irq.lock().port)
    }
}
