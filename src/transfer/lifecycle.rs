//! Transfer lifecycle manager
//!
//! Owns pipes, transfer slots and the descriptor arena. Everything here runs
//! under the host's transfer-list lock; register access goes through the
//! [`IrqDomain`] the caller already holds.

use crate::descriptor::{Chain, DescriptorPool, PoolStats, TdFlags, TdKind};
use crate::dispatcher::IrqDomain;
use crate::error::{Result, TransferStatus, UsbError};
use crate::otg::{HostConfig, RegisterPort};
use crate::protocol::{self, Step};
use crate::transfer::chain::{self, ChainSeed};
use crate::transfer::{
    Completion, Direction, EndpointConfig, PipeHandle, TransferHandle, TransferRequest, TransferState, TransferType,
};

/// Transfers that may be outstanding at once
pub const MAX_TRANSFERS: usize = 16;
/// Pipes that may be open at once
pub const MAX_PIPES: usize = 16;
/// Data bytes one transfer may carry
pub const MAX_TRANSFER_SIZE: usize = 1024;
/// Descriptors shared by all outstanding transfers
pub const DESCRIPTOR_POOL_SIZE: usize = 256;

/// An opened endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pipe {
    config: EndpointConfig,
    /// Data toggle for the next transfer
    toggle: bool,
    /// Pacing value at which the next periodic packet may go out
    tmr_val: u8,
    tmr_res: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipeSlot {
    generation: u16,
    pipe: Option<Pipe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Pending,
    Active,
    Done(TransferStatus),
}

struct TransferSlot {
    generation: u16,
    state: SlotState,
    pipe: PipeHandle,
    chain: Chain,
    /// Index into `chain` of the current descriptor
    cursor: usize,
    setup: [u8; 8],
    data: heapless::Vec<u8, MAX_TRANSFER_SIZE>,
    direction: Option<Direction>,
    requested: usize,
    short_ok: bool,
    /// Tick count at which the transfer times out
    deadline: Option<u32>,
    actual: usize,
    error: Option<UsbError>,
}

impl TransferSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            state: SlotState::Free,
            pipe: PipeHandle { index: 0, generation: 0 },
            chain: Chain::new(),
            cursor: 0,
            setup: [0; 8],
            data: heapless::Vec::new(),
            direction: None,
            requested: 0,
            short_ok: true,
            deadline: None,
            actual: 0,
            error: None,
        }
    }

    fn handle(&self, index: usize) -> TransferHandle {
        TransferHandle { index: index as u8, generation: self.generation }
    }
}

/// State touched only under the transfer-list lock
pub struct TransferDomain {
    config: HostConfig,
    pipes: [PipeSlot; MAX_PIPES],
    slots: [TransferSlot; MAX_TRANSFERS],
    pool: DescriptorPool<DESCRIPTOR_POOL_SIZE>,
    pending: heapless::Vec<u8, MAX_TRANSFERS>,
    active: heapless::Vec<u8, MAX_TRANSFERS>,
    ticks: u32,
}

impl TransferDomain {
    /// Create an empty domain
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            pipes: [PipeSlot { generation: 0, pipe: None }; MAX_PIPES],
            slots: core::array::from_fn(|_| TransferSlot::new()),
            pool: DescriptorPool::new(),
            pending: heapless::Vec::new(),
            active: heapless::Vec::new(),
            ticks: 0,
        }
    }

    // === Pipes ===

    /// Open a pipe for an endpoint
    pub fn open(&mut self, config: EndpointConfig) -> Result<PipeHandle> {
        config.validate()?;
        let Some(index) = self.pipes.iter().position(|p| p.pipe.is_none()) else {
            return Err(UsbError::NoResources);
        };
        let slot = &mut self.pipes[index];
        slot.pipe = Some(Pipe {
            config,
            toggle: false,
            tmr_val: 0,
            tmr_res: chain::pacing_interval(&config, self.config.timer_period_ms),
        });
        Ok(PipeHandle { index: index as u8, generation: slot.generation })
    }

    fn pipe(&self, handle: PipeHandle) -> Result<&Pipe> {
        self.pipes
            .get(handle.index())
            .filter(|p| p.generation == handle.generation)
            .and_then(|p| p.pipe.as_ref())
            .ok_or(UsbError::InvalidHandle)
    }

    fn pipe_mut(&mut self, handle: PipeHandle) -> Result<&mut Pipe> {
        self.pipes
            .get_mut(handle.index())
            .filter(|p| p.generation == handle.generation)
            .and_then(|p| p.pipe.as_mut())
            .ok_or(UsbError::InvalidHandle)
    }

    /// Endpoint parameters of an open pipe
    pub fn pipe_config(&self, handle: PipeHandle) -> Result<EndpointConfig> {
        self.pipe(handle).map(|p| p.config)
    }

    /// Current data toggle of a pipe (false = DATA0)
    pub fn pipe_toggle(&self, handle: PipeHandle) -> Result<bool> {
        self.pipe(handle).map(|p| p.toggle)
    }

    /// Reset the pipe's data toggle after the endpoint halt was cleared
    pub fn clear_halt(&mut self, handle: PipeHandle) -> Result<()> {
        self.pipe_mut(handle)?.toggle = false;
        Ok(())
    }

    /// Close a pipe, cancelling everything still outstanding on it
    pub fn close<P: RegisterPort>(
        &mut self,
        handle: PipeHandle,
        hw: &mut IrqDomain<P>,
        out: &mut impl FnMut(Completion),
    ) -> Result<()> {
        self.pipe(handle)?;
        for index in 0..MAX_TRANSFERS {
            let slot = &self.slots[index];
            if slot.pipe != handle || !matches!(slot.state, SlotState::Pending | SlotState::Active) {
                continue;
            }
            let transfer = slot.handle(index);
            if let Some(c) = self.abort(transfer, hw, UsbError::Cancelled)? {
                out(c);
            }
        }
        let slot = &mut self.pipes[handle.index()];
        slot.pipe = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    // === Submission ===

    /// Build the chain for `req` and queue it
    pub fn submit(&mut self, handle: PipeHandle, req: &TransferRequest<'_>, pacing: u8) -> Result<TransferHandle> {
        let pipe = *self.pipe(handle)?;
        let control = pipe.config.transfer_type == TransferType::Control;
        if control != req.setup.is_some() {
            return Err(UsbError::InvalidParameter);
        }
        if !control {
            if let Some(dir) = req.data_direction() {
                if dir != pipe.config.direction {
                    return Err(UsbError::InvalidParameter);
                }
            }
        }
        if req.data_len() > MAX_TRANSFER_SIZE {
            return Err(UsbError::BufferOverflow);
        }
        let Some(index) = self.slots.iter().position(|s| s.state == SlotState::Free) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("no free transfer slot");
            return Err(UsbError::NoResources);
        };

        // Toggle and pacing are reseeded from the pipe when the transfer reaches the head
        let seed = ChainSeed { toggle: pipe.toggle, tmr_val: pacing, tmr_res: pipe.tmr_res };
        let chain = chain::build_chain(&mut self.pool, &pipe.config, req, seed)?;

        let timeout_ms = req.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let deadline = (timeout_ms != 0).then(|| self.ticks.wrapping_add(self.config.ms_to_ticks(timeout_ms)));

        let slot = &mut self.slots[index];
        slot.state = SlotState::Pending;
        slot.pipe = handle;
        slot.chain = chain;
        slot.cursor = 0;
        slot.setup = req.setup.map(|s| s.to_bytes()).unwrap_or([0; 8]);
        slot.data.clear();
        match req.data_direction() {
            Some(Direction::In) => {
                // Length checked against MAX_TRANSFER_SIZE above
                let _ = slot.data.resize(req.in_length, 0);
            }
            _ => {
                let _ = slot.data.extend_from_slice(req.out_data);
            }
        }
        slot.direction = req.data_direction();
        slot.requested = req.data_len();
        slot.short_ok = req.short_ok;
        slot.deadline = deadline;
        slot.actual = 0;
        slot.error = None;
        let transfer = slot.handle(index);

        // Capacity equals the slot count
        let _ = self.pending.push(index as u8);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "submit: xfer {} ep{} len={} tds={}",
            index,
            pipe.config.endpoint,
            req.data_len(),
            self.slots[index].chain.len()
        );
        Ok(transfer)
    }

    fn lookup(&self, handle: TransferHandle) -> Result<usize> {
        let index = handle.index();
        match self.slots.get(index) {
            Some(s) if s.generation == handle.generation && s.state != SlotState::Free => Ok(index),
            _ => Err(UsbError::InvalidHandle),
        }
    }

    /// Current progress of a transfer
    pub fn status(&self, handle: TransferHandle) -> Result<TransferState> {
        let index = self.lookup(handle)?;
        Ok(match self.slots[index].state {
            SlotState::Done(status) => TransferState::Done(status),
            SlotState::Active => TransferState::Active,
            _ => TransferState::Pending,
        })
    }

    /// Copy IN data of a completed transfer out and free its slot
    ///
    /// Returns the number of bytes copied.
    pub fn reclaim(&mut self, handle: TransferHandle, buf: &mut [u8]) -> Result<usize> {
        let index = self.lookup(handle)?;
        let slot = &mut self.slots[index];
        if !matches!(slot.state, SlotState::Done(_)) {
            return Err(UsbError::InvalidState);
        }
        let mut copied = 0;
        if slot.direction == Some(Direction::In) {
            copied = slot.actual.min(slot.data.len());
            if buf.len() < copied {
                return Err(UsbError::BufferOverflow);
            }
            buf[..copied].copy_from_slice(&slot.data[..copied]);
        }
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.data.clear();
        Ok(copied)
    }

    /// Error a completed transfer finished with
    pub fn error(&self, handle: TransferHandle) -> Result<Option<UsbError>> {
        let index = self.lookup(handle)?;
        match self.slots[index].state {
            SlotState::Done(_) => Ok(self.slots[index].error),
            _ => Err(UsbError::InvalidState),
        }
    }

    /// Free a completed transfer without copying its data
    pub fn discard(&mut self, handle: TransferHandle) -> Result<()> {
        let index = self.lookup(handle)?;
        let slot = &mut self.slots[index];
        if !matches!(slot.state, SlotState::Done(_)) {
            return Err(UsbError::InvalidState);
        }
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.data.clear();
        Ok(())
    }

    /// Anything queued or in flight
    #[inline(always)]
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.active.is_empty()
    }

    /// Transfers currently being executed
    #[inline(always)]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Descriptor arena utilization
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Timer ticks seen so far
    #[inline(always)]
    pub const fn ticks(&self) -> u32 {
        self.ticks
    }

    // === Execution ===

    /// Promote pending transfers and pump every active one
    ///
    /// A transfer that finishes lets the next one queued on its pipe start in
    /// the same pass. Returns the number of transfers that finished.
    pub fn service<P: RegisterPort>(
        &mut self,
        hw: &mut IrqDomain<P>,
        tmr_val: u8,
        out: &mut impl FnMut(Completion),
    ) -> usize {
        let mut finished = 0;
        let mut start = 0;
        loop {
            self.promote(tmr_val);
            let done = self.pump_from(start, hw, tmr_val, out);
            finished += done;
            if done == 0 || self.pending.is_empty() {
                return finished;
            }
            start = self.active.len();
        }
    }

    /// Check if a transfer on `pipe` is already executing
    fn pipe_busy(&self, pipe: PipeHandle) -> bool {
        self.active.iter().any(|i| self.slots[*i as usize].pipe == pipe)
    }

    /// Move the head transfer of every idle pipe to the active set
    ///
    /// Pipes run one transfer at a time in submission order, so the data
    /// toggle and pacing value are taken from the pipe only at this point.
    fn promote(&mut self, tmr_val: u8) {
        let mut i = 0;
        while i < self.pending.len() {
            let index = self.pending[i] as usize;
            let pipe = self.slots[index].pipe;
            let queued_behind = self.pending[..i].iter().any(|p| self.slots[*p as usize].pipe == pipe);
            if queued_behind || self.pipe_busy(pipe) {
                i += 1;
                continue;
            }
            self.pending.remove(i);
            self.seed(index, tmr_val);
            self.slots[index].state = SlotState::Active;
            // Active and pending never hold more than MAX_TRANSFERS together
            let _ = self.active.push(index as u8);
        }
    }

    /// Load the pipe's toggle and pacing value into the head of a chain
    fn seed(&mut self, index: usize, tmr_val: u8) {
        let Self { slots, pool, pipes, .. } = self;
        let slot = &slots[index];
        let Some(pipe) = pipes
            .get(slot.pipe.index())
            .filter(|p| p.generation == slot.pipe.generation)
            .and_then(|p| p.pipe.as_ref())
        else {
            return;
        };
        // A pacing value already in the past means the endpoint may go now
        let tmr = if tmr_val.wrapping_sub(pipe.tmr_val) < 128 { tmr_val } else { pipe.tmr_val };
        let control = pipe.config.transfer_type == TransferType::Control;
        if let Some(td) = slot.chain.first().and_then(|h| pool.get_mut(*h)) {
            if !control {
                td.toggle = pipe.toggle;
            }
            td.tmr_val = tmr;
        }
    }

    /// Pump active transfers from position `start` on
    fn pump_from<P: RegisterPort>(
        &mut self,
        start: usize,
        hw: &mut IrqDomain<P>,
        tmr_val: u8,
        out: &mut impl FnMut(Completion),
    ) -> usize {
        let mut finished = 0;
        let mut i = start;
        while i < self.active.len() {
            let index = self.active[i] as usize;
            match self.pump(index, hw, tmr_val) {
                None => i += 1,
                Some(err) => {
                    self.active.remove(i);
                    out(self.finish(index, err, false));
                    finished += 1;
                }
            }
        }
        finished
    }

    /// Run descriptors of one transfer until one is busy or the chain ends
    ///
    /// Returns `Some(error)` once the transfer is finished.
    fn pump<P: RegisterPort>(&mut self, index: usize, hw: &mut IrqDomain<P>, tmr_val: u8) -> Option<Option<UsbError>> {
        let Self { slots, pool, .. } = self;
        let slot = &mut slots[index];
        loop {
            let Some(td) = slot.chain.get(slot.cursor).and_then(|h| pool.get_mut(*h)) else {
                return Some(Some(UsbError::InvalidState));
            };
            let buf: &mut [u8] = if td.kind == TdKind::SetupTx {
                &mut slot.setup[..]
            } else {
                &mut slot.data[..]
            };

            match protocol::step(hw, td, buf, tmr_val) {
                Step::Busy => return None,
                Step::Terminate(err) => return Some(Some(err)),
                Step::Advance => {}
            }

            let (toggle, tmr, flags) = (td.toggle, td.tmr_val, td.flags);
            if flags.contains(TdFlags::LAST) {
                return Some(None);
            }
            let next = if flags.contains(TdFlags::GOT_SHORT) {
                if !flags.contains(TdFlags::ALT_NEXT) {
                    return Some(None);
                }
                // Short control data stage skips straight to STATUS
                slot.chain.len() - 1
            } else {
                slot.cursor + 1
            };
            slot.cursor = next;
            if let Some(td) = slot.chain.get(next).and_then(|h| pool.get_mut(*h)) {
                td.toggle = toggle;
                td.tmr_val = tmr;
            }
        }
    }

    /// Aggregate the chain, update the pipe and free the descriptors
    ///
    /// `forced` overrides whatever the chain recorded (abort and timeout).
    fn finish(&mut self, index: usize, err: Option<UsbError>, forced: bool) -> Completion {
        let Self { slots, pool, pipes, .. } = self;
        let slot = &mut slots[index];

        let retries = slot
            .chain
            .iter()
            .filter_map(|h| pool.get(*h))
            .map(|td| u32::from(td.attempts.saturating_sub(1)))
            .sum();

        let mut actual = 0;
        let mut first_error = None;
        for td in slot.chain.iter().filter_map(|h| pool.get(*h)) {
            if td.kind != TdKind::SetupTx {
                actual += td.actual;
            }
            if td.error.is_some() {
                first_error = td.error;
                break;
            }
            if td.got_short() && !td.flags.intersects(TdFlags::ALT_NEXT | TdFlags::STATUS_STAGE) {
                break;
            }
        }
        let mut error = if forced { err } else { first_error.or(err) };
        if error.is_none() && !slot.short_ok && slot.direction == Some(Direction::In) && actual < slot.requested {
            error = Some(UsbError::ShortPacket);
        }

        // Persist toggle and pacing of the last executed descriptor
        if let Some(td) = slot.chain.get(slot.cursor).and_then(|h| pool.get(*h)) {
            if let Some(pipe) = pipes
                .get_mut(slot.pipe.index())
                .filter(|p| p.generation == slot.pipe.generation)
                .and_then(|p| p.pipe.as_mut())
            {
                pipe.toggle = td.toggle;
                pipe.tmr_val = td.tmr_val;
            }
        }
        pool.release_chain(&mut slot.chain);

        let status = TransferStatus::from(error);
        slot.state = SlotState::Done(status);
        slot.actual = actual;
        slot.error = error;
        slot.deadline = None;

        #[cfg(feature = "defmt")]
        defmt::debug!("complete: xfer {} status={} actual={}", index, status, actual);

        Completion {
            transfer: slot.handle(index),
            pipe: slot.pipe,
            status,
            error,
            actual_length: actual,
            retries,
        }
    }

    /// Tear down an outstanding transfer and complete it with `err`
    ///
    /// Returns `Ok(None)` when the transfer already completed.
    pub fn abort<P: RegisterPort>(
        &mut self,
        handle: TransferHandle,
        hw: &mut IrqDomain<P>,
        err: UsbError,
    ) -> Result<Option<Completion>> {
        let index = self.lookup(handle)?;
        let state = self.slots[index].state;
        let queue = match state {
            SlotState::Done(_) | SlotState::Free => return Ok(None),
            SlotState::Pending => &mut self.pending,
            SlotState::Active => &mut self.active,
        };
        if let Some(pos) = queue.iter().position(|i| *i as usize == index) {
            queue.remove(pos);
        }

        let Self { slots, pool, .. } = self;
        for h in slots[index].chain.iter() {
            let Some(td) = pool.get_mut(*h) else {
                continue;
            };
            if td.channel.is_some() {
                hw.channels.release(&mut hw.port, &mut hw.fifo, td);
            }
            td.fail(err);
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("abort: xfer {} ({})", index, err);
        Ok(Some(self.finish(index, Some(err), true)))
    }

    /// Advance the tick count, lift NAK throttles and expire deadlines
    pub fn tick<P: RegisterPort>(&mut self, hw: &mut IrqDomain<P>, out: &mut impl FnMut(Completion)) {
        self.ticks = self.ticks.wrapping_add(1);

        let Self { slots, pool, active, .. } = self;
        for index in active.iter() {
            let slot = &slots[*index as usize];
            if let Some(td) = slot.chain.get(slot.cursor).and_then(|h| pool.get_mut(*h)) {
                td.flags.remove(TdFlags::DID_NAK | TdFlags::NAK_WAIT);
            }
        }

        let now = self.ticks;
        let mut expired = heapless::Vec::<TransferHandle, MAX_TRANSFERS>::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(deadline) = slot.deadline else {
                continue;
            };
            if matches!(slot.state, SlotState::Pending | SlotState::Active) && (now.wrapping_sub(deadline) as i32) >= 0 {
                let _ = expired.push(slot.handle(index));
            }
        }
        for handle in expired {
            #[cfg(feature = "defmt")]
            defmt::warn!("xfer {} timed out", handle.index());
            if let Ok(Some(c)) = self.abort(handle, hw, UsbError::Timeout) {
                out(c);
            }
        }
    }
}
