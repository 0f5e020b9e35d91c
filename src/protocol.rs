//! Per-descriptor protocol state machine
//!
//! [`step`] advances one descriptor on its channel using the interrupt
//! conditions latched since the last call. Each state has its own transition
//! function; a step ends in [`Step::Busy`] (come back later),
//! [`Step::Advance`] (descriptor done, move to the next one) or
//! [`Step::Terminate`] (chain ends with an error).
//!
//! Split transactions:
//! - OUT start-splits are not issued in microframes 7 and 0.
//! - Periodic IN start-splits go out only in microframe 0.
//! - Bulk/control IN start-splits are not issued from microframe 6 on.
//! - A complete-split never goes out in the microframe of the previous split
//!   token, and a start-split gets `COMPLETE_SPLIT_NYET_LIMIT` NYETs before
//!   it fails.

use crate::descriptor::{Descriptor, TdFlags, TdKind, TdState};
use crate::dispatcher::IrqDomain;
use crate::error::UsbError;
use crate::otg::{self, hctsiz, HcChar, HcInt, HcSplt, RegisterPort, HFNUM};
use crate::transfer::TransferType;

/// Complete-split NYETs tolerated per start-split, one frame's worth
pub const COMPLETE_SPLIT_NYET_LIMIT: u8 = 8;

/// Result of one protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// Waiting on hardware, pacing or a free channel
    Busy,
    /// Descriptor finished, the chain may move on
    Advance,
    /// Descriptor failed, the chain ends here
    Terminate(UsbError),
}

/// Run the protocol function for `td`
///
/// `buf` is the descriptor's view of the transfer data: the 8 setup bytes for
/// a SETUP descriptor, the whole transfer buffer otherwise. `tmr_val` is the
/// current pacing counter.
pub fn step<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &mut [u8], tmr_val: u8) -> Step {
    if let Some(err) = td.error {
        return Step::Terminate(err);
    }
    if td.channel.is_none() && !hw.channels.acquire(&mut hw.fifo, td) {
        hw.exhausted = hw.exhausted.wrapping_add(1);
        return Step::Busy;
    }
    let Some(ch) = td.channel.map(usize::from) else {
        return Step::Busy;
    };

    if td.kind == TdKind::DataRx {
        if let Some(outcome) = receive_latched(hw, td, buf, ch) {
            return outcome;
        }
    }

    let hcint = match evaluate(hw, td, ch) {
        Ok(hcint) => hcint,
        Err(outcome) => return outcome,
    };

    match td.kind {
        TdKind::SetupTx => setup_tx(hw, td, buf, ch, hcint),
        TdKind::DataTx => data_tx(hw, td, buf, ch, hcint, tmr_val),
        TdKind::DataRx => data_rx(hw, td, ch, hcint, tmr_val),
    }
}

/// Common handshake evaluation shared by every protocol function
///
/// Success handshakes take priority over error bits seen in the same window.
/// A disable is issued for every completed attempt so the channel is idle
/// before the next packet. Conditions stay latched while a retry waits for a
/// channel; they are counted and acted on once per issued token.
fn evaluate<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize) -> Result<HcInt, Step> {
    let mut hcint = hw.channels.hcint(ch);
    if td.ep_type == TransferType::Isochronous && hcint.contains(HcInt::XFERCOMPL) {
        // No handshake phase on isochronous endpoints
        hcint |= HcInt::ACK;
    }
    let fresh = !td.flags.contains(TdFlags::HANDSHAKE_SEEN);

    if hcint.intersects(HcInt::RETRY | HcInt::ACK | HcInt::NYET) {
        // Success bits win over errors latched in the same window
        hcint.remove(HcInt::ERRORS);
    } else if hcint.contains(HcInt::STALL) {
        #[cfg(feature = "defmt")]
        defmt::debug!("CH{}: STALL", ch);
        return Err(terminate(hw, td, UsbError::Stalled));
    } else if hcint.intersects(HcInt::ERRORS) && fresh {
        td.errcnt = td.errcnt.saturating_add(1);
        if td.is_split() {
            #[cfg(feature = "defmt")]
            defmt::debug!("CH{}: split error hcint={=u32:#x}", ch, hcint.bits());
            return Err(terminate(hw, td, UsbError::SplitError));
        }
        if td.errcnt >= hw.max_errors {
            #[cfg(feature = "defmt")]
            defmt::debug!("CH{}: error budget exhausted hcint={=u32:#x}", ch, hcint.bits());
            return Err(terminate(hw, td, UsbError::TransactionError));
        }
    }

    if fresh && hcint.intersects(HcInt::ERRORS | HcInt::RETRY | HcInt::ACK | HcInt::NYET) {
        td.flags |= TdFlags::HANDSHAKE_SEEN;
        hw.channels.disable(&mut hw.port, ch);
        if !hcint.intersects(HcInt::ERRORS) {
            td.errcnt = 0;
        }
    }
    Ok(hcint)
}

/// Copy a latched IN packet for this channel into the transfer buffer
fn receive_latched<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &mut [u8], ch: usize) -> Option<Step> {
    if !matches!(td.state, TdState::WaitAckNoError | TdState::WaitCompleteSplitAck) {
        return None;
    }
    let end = (td.offset + td.remainder).min(buf.len());
    let start = td.offset.min(end);
    let received = hw.fifo.take(ch, &mut buf[start..end], td.max_packet as usize)?;

    match received {
        Ok(r) => {
            if r.short {
                td.flags |= TdFlags::GOT_SHORT;
            }
            if !td.flags.contains(TdFlags::STATUS_STAGE) {
                td.toggle = !td.toggle;
            }
            td.advance_data(r.bytes);
            hw.channels.latch(ch, HcInt::SOFTWARE_ONLY | HcInt::ACK);
            None
        }
        Err(err) => {
            #[cfg(feature = "defmt")]
            defmt::debug!("CH{}: invalid rx packet length", ch);
            Some(terminate(hw, td, err))
        }
    }
}

/// Descriptor finished: give the channel back and advance
fn complete<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor) -> Step {
    hw.channels.release(&mut hw.port, &mut hw.fifo, td);
    Step::Advance
}

/// Descriptor failed: record the error, give the channel back
fn terminate<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, err: UsbError) -> Step {
    td.fail(err);
    hw.channels.release(&mut hw.port, &mut hw.fifo, td);
    Step::Terminate(err)
}

/// Wait in `state`; optionally hand the channel back while waiting
fn park<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, state: TdState, release: bool) -> Step {
    td.state = state;
    if release {
        hw.channels.release(&mut hw.port, &mut hw.fifo, td);
    }
    Step::Busy
}

/// Note a NAK (or retried error) for pacing
fn note_retry(td: &mut Descriptor) {
    if td.flags.contains(TdFlags::DID_NAK) {
        td.flags |= TdFlags::NAK_WAIT;
    }
    td.flags |= TdFlags::DID_NAK;
}

/// Check whether the next packet must wait for the timer
///
/// Periodic endpoints go out once per `tmr_res` ticks. Control and bulk
/// endpoints retry right after a first NAK, then wait for the next tick.
fn rate_limited<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, tmr_val: u8) -> bool {
    if let Some(ch) = td.channel {
        if hw.channels.is_suspended(ch as usize) {
            return true;
        }
    }

    if td.ep_type.is_periodic() {
        let delta = tmr_val.wrapping_sub(td.tmr_val);
        if delta >= 128 {
            return true;
        }
        td.tmr_val = tmr_val.wrapping_add(td.tmr_res);

        // Target the next frame's parity
        let frame = hw.port.read(HFNUM) & 0xFFFF;
        if frame & 1 == 0 {
            td.hcchar |= HcChar::ODDFRM;
        } else {
            td.hcchar.remove(HcChar::ODDFRM);
        }
    } else if td.flags.contains(TdFlags::NAK_WAIT) {
        return true;
    }

    if td.ep_type == TransferType::Isochronous {
        td.toggle = false;
    } else if td.flags.contains(TdFlags::SET_TOGGLE) {
        td.flags.remove(TdFlags::SET_TOGGLE);
        td.toggle = true;
    }
    false
}

#[inline(always)]
fn current_microframe<P: RegisterPort>(hw: &mut IrqDomain<P>) -> u8 {
    otg::microframe(hw.port.read(HFNUM))
}

#[inline(always)]
fn data_pid(td: &Descriptor) -> u32 {
    if td.toggle {
        hctsiz::PID_DATA1
    } else {
        hctsiz::PID_DATA0
    }
}

/// Program the channel and enable it
fn issue<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, bytes: usize, pid: u32, dir_in: bool) {
    let mut hcchar = td.hcchar.difference(HcChar::CHDIS | HcChar::EPDIR_IN);
    if dir_in {
        hcchar |= HcChar::EPDIR_IN;
    }
    hw.port.write(otg::hcsplt(ch), td.hcsplt.bits());
    hw.port.write(otg::hctsiz(ch), hctsiz::encode(bytes as u32, 1, pid));
    hw.port.write(otg::hcchar(ch), (hcchar | HcChar::CHENA).bits());
    td.attempts = td.attempts.saturating_add(1);

    // Anything latched so far answered an earlier token
    hw.channels.clear_hcint(ch);
    td.flags.remove(TdFlags::HANDSHAKE_SEEN);
}

/// Count a NYET on a complete-split; fails the split once the hub has had a
/// frame to finish it
fn complete_split_nyet<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor) -> Option<Step> {
    td.nyet_count = td.nyet_count.saturating_add(1);
    if td.nyet_count > COMPLETE_SPLIT_NYET_LIMIT {
        #[cfg(feature = "defmt")]
        defmt::debug!("complete-split NYET limit reached");
        return Some(terminate(hw, td, UsbError::SplitError));
    }
    None
}

// === SETUP stage ===

fn setup_tx<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, hcint: HcInt) -> Step {
    match td.state {
        TdState::Start | TdState::SendData | TdState::SendDataSynchronized => send_setup(hw, td, buf, ch),
        TdState::WaitAckNoError => setup_wait_ack(hw, td, buf, ch, hcint),
        TdState::WaitStartSplitAck => setup_wait_start_split(hw, td, buf, ch, hcint),
        TdState::WaitCompleteSplitAck => setup_wait_complete_split(hw, td, buf, ch, hcint),
        TdState::SendCompleteSplit => send_complete_split(hw, td, ch, hctsiz::PID_SETUP, |hw, td, ch| {
            send_setup(hw, td, buf, ch)
        }),
        _ => Step::Busy,
    }
}

fn setup_wait_ack<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, hcint: HcInt) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_setup(hw, td, buf, ch);
    }
    if hcint.intersects(HcInt::ACK | HcInt::NYET) {
        td.advance_data(td.tx_bytes);
        td.toggle = true;
        return complete(hw, td);
    }
    Step::Busy
}

fn setup_wait_start_split<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, hcint: HcInt) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_setup(hw, td, buf, ch);
    }
    if hcint.intersects(HcInt::ACK | HcInt::NYET) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::SendCompleteSplit;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_complete_split(hw, td, ch, hctsiz::PID_SETUP, |hw, td, ch| send_setup(hw, td, buf, ch));
    }
    Step::Busy
}

fn setup_wait_complete_split<P: RegisterPort>(
    hw: &mut IrqDomain<P>,
    td: &mut Descriptor,
    buf: &[u8],
    ch: usize,
    hcint: HcInt,
) -> Step {
    if hcint.contains(HcInt::NYET) {
        if let Some(step) = complete_split_nyet(hw, td) {
            return step;
        }
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::SendCompleteSplit;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_complete_split(hw, td, ch, hctsiz::PID_SETUP, |hw, td, ch| send_setup(hw, td, buf, ch));
    }
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_setup(hw, td, buf, ch);
    }
    if hcint.contains(HcInt::ACK) {
        td.advance_data(td.tx_bytes);
        td.toggle = true;
        return complete(hw, td);
    }
    Step::Busy
}

fn send_setup<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize) -> Step {
    if buf.len() != 8 || td.remainder != 8 {
        return terminate(hw, td, UsbError::InvalidParameter);
    }
    if td.is_split() {
        let uf = current_microframe(hw);
        if uf == 7 || uf == 0 {
            hw.sof_wanted = true;
            return park(hw, td, TdState::SendDataSynchronized, true);
        }
        td.hcsplt.remove(HcSplt::COMPSPLT);
        td.curr_frame = uf;
        td.nyet_count = 0;
        td.state = TdState::WaitStartSplitAck;
    } else {
        td.state = TdState::WaitAckNoError;
    }

    issue(hw, td, ch, 8, hctsiz::PID_SETUP, false);
    td.tx_bytes = hw.fifo.transmit(&mut hw.port, ch, &buf[..8]);
    Step::Busy
}

/// Issue an OUT complete-split, or fall back to `restart` when the
/// start-split window was lost
fn send_complete_split<P, F>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, pid: u32, restart: F) -> Step
where
    P: RegisterPort,
    F: FnOnce(&mut IrqDomain<P>, &mut Descriptor, usize) -> Step,
{
    let uf = current_microframe(hw);
    if uf == td.curr_frame {
        hw.sof_wanted = true;
        return park(hw, td, TdState::SendCompleteSplit, false);
    }
    if uf == 0 {
        // Frame rolled over, the hub dropped the start-split
        return restart(hw, td, ch);
    }
    td.hcsplt |= HcSplt::COMPSPLT;
    td.curr_frame = uf;
    td.state = TdState::WaitCompleteSplitAck;
    issue(hw, td, ch, 0, pid, false);
    Step::Busy
}

// === OUT data ===

fn data_tx<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, hcint: HcInt, tmr: u8) -> Step {
    match td.state {
        TdState::Start | TdState::SendData | TdState::SendDataSynchronized => send_data(hw, td, buf, ch, tmr),
        TdState::WaitAckNoError => tx_wait_ack(hw, td, buf, ch, hcint, tmr),
        TdState::WaitStartSplitAck => tx_wait_start_split(hw, td, buf, ch, hcint, tmr),
        TdState::WaitCompleteSplitAck => tx_wait_complete_split(hw, td, buf, ch, hcint, tmr),
        TdState::SendCompleteSplit => {
            let pid = data_pid(td);
            send_complete_split(hw, td, ch, pid, |hw, td, ch| send_data(hw, td, buf, ch, tmr))
        }
        _ => Step::Busy,
    }
}

/// Account for an acknowledged OUT packet
fn tx_acked<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, tmr: u8) -> Step {
    td.advance_data(td.tx_bytes);
    if !td.flags.contains(TdFlags::STATUS_STAGE) {
        td.toggle = !td.toggle;
    }
    if td.remainder == 0 {
        return complete(hw, td);
    }
    if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
        td.state = TdState::SendData;
        return Step::Busy;
    }
    let ch = td.channel.map(usize::from).unwrap_or(ch);
    send_data(hw, td, buf, ch, tmr)
}

fn tx_wait_ack<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, hcint: HcInt, tmr: u8) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_data(hw, td, buf, ch, tmr);
    }
    if hcint.intersects(HcInt::ACK | HcInt::NYET) {
        return tx_acked(hw, td, buf, ch, tmr);
    }
    Step::Busy
}

fn tx_wait_start_split<P: RegisterPort>(
    hw: &mut IrqDomain<P>,
    td: &mut Descriptor,
    buf: &[u8],
    ch: usize,
    hcint: HcInt,
    tmr: u8,
) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_data(hw, td, buf, ch, tmr);
    }
    if hcint.intersects(HcInt::ACK | HcInt::NYET) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::SendCompleteSplit;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        let pid = data_pid(td);
        return send_complete_split(hw, td, ch, pid, |hw, td, ch| send_data(hw, td, buf, ch, tmr));
    }
    Step::Busy
}

fn tx_wait_complete_split<P: RegisterPort>(
    hw: &mut IrqDomain<P>,
    td: &mut Descriptor,
    buf: &[u8],
    ch: usize,
    hcint: HcInt,
    tmr: u8,
) -> Step {
    if hcint.contains(HcInt::NYET) {
        if let Some(step) = complete_split_nyet(hw, td) {
            return step;
        }
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::SendCompleteSplit;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        let pid = data_pid(td);
        return send_complete_split(hw, td, ch, pid, |hw, td, ch| send_data(hw, td, buf, ch, tmr));
    }
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return send_data(hw, td, buf, ch, tmr);
    }
    if hcint.contains(HcInt::ACK) {
        return tx_acked(hw, td, buf, ch, tmr);
    }
    Step::Busy
}

fn send_data<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, buf: &[u8], ch: usize, tmr: u8) -> Step {
    let periodic = td.ep_type.is_periodic();
    let split_uf = if td.is_split() {
        let uf = current_microframe(hw);
        if uf == 7 || uf == 0 {
            hw.sof_wanted = true;
            return park(hw, td, TdState::SendDataSynchronized, true);
        }
        Some(uf)
    } else {
        None
    };
    if rate_limited(hw, td, tmr) {
        return park(hw, td, TdState::SendData, periodic);
    }

    if let Some(uf) = split_uf {
        td.hcsplt.remove(HcSplt::COMPSPLT);
        if td.ep_type == TransferType::Isochronous {
            td.hcsplt = td.hcsplt.difference(HcSplt::XACTPOS_MASK) | HcSplt::XACTPOS_ALL;
        }
        td.curr_frame = uf;
        td.nyet_count = 0;
        td.state = TdState::WaitStartSplitAck;
    } else {
        td.state = TdState::WaitAckNoError;
    }

    let count = td.remainder.min(td.max_packet as usize);
    let start = td.offset.min(buf.len());
    let end = (start + count).min(buf.len());
    let pid = data_pid(td);
    issue(hw, td, ch, end - start, pid, false);
    td.tx_bytes = hw.fifo.transmit(&mut hw.port, ch, &buf[start..end]);
    Step::Busy
}

// === IN data ===

fn data_rx<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, hcint: HcInt, tmr: u8) -> Step {
    match td.state {
        TdState::Start => {
            if td.is_split() {
                receive_start_split(hw, td, ch, tmr)
            } else {
                receive_data(hw, td, ch, tmr)
            }
        }
        TdState::WaitAckNoError => rx_wait_ack(hw, td, ch, hcint, tmr),
        TdState::WaitStartSplitAck => rx_wait_start_split(hw, td, ch, hcint, tmr),
        TdState::WaitCompleteSplitAck => rx_wait_complete_split(hw, td, ch, hcint, tmr),
        TdState::ReceiveData => receive_data(hw, td, ch, tmr),
        TdState::ReceiveStartSplit | TdState::ReceiveStartSplitSynchronized => receive_start_split(hw, td, ch, tmr),
        _ => Step::Busy,
    }
}

fn rx_wait_ack<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, hcint: HcInt, tmr: u8) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return receive_data(hw, td, ch, tmr);
    }
    // ACK alone means the payload has not been drained yet
    if hcint.contains(HcInt::SOFTWARE_ONLY) && hcint.contains(HcInt::ACK) {
        return complete(hw, td);
    }
    Step::Busy
}

fn rx_wait_start_split<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, hcint: HcInt, tmr: u8) -> Step {
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return receive_start_split(hw, td, ch, tmr);
    }
    if hcint.intersects(HcInt::ACK | HcInt::NYET) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::ReceiveData;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return receive_data(hw, td, ch, tmr);
    }
    Step::Busy
}

fn rx_wait_complete_split<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, hcint: HcInt, tmr: u8) -> Step {
    if hcint.contains(HcInt::SOFTWARE_ONLY) && hcint.contains(HcInt::ACK) {
        return complete(hw, td);
    }
    if hcint.contains(HcInt::NYET) {
        if let Some(step) = complete_split_nyet(hw, td) {
            return step;
        }
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            td.state = TdState::ReceiveData;
            return Step::Busy;
        }
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return receive_data(hw, td, ch, tmr);
    }
    if hcint.intersects(HcInt::RETRY | HcInt::ERRORS) {
        if !hw.channels.reassign_on_retry(&mut hw.fifo, td) {
            return Step::Busy;
        }
        note_retry(td);
        let ch = td.channel.map(usize::from).unwrap_or(ch);
        return receive_start_split(hw, td, ch, tmr);
    }
    Step::Busy
}

fn receive_start_split<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, tmr: u8) -> Step {
    let periodic = td.ep_type.is_periodic();
    let uf = current_microframe(hw);
    let window_closed = if periodic { uf != 0 } else { uf >= 6 };
    if window_closed {
        hw.sof_wanted = true;
        return park(hw, td, TdState::ReceiveStartSplitSynchronized, true);
    }
    if rate_limited(hw, td, tmr) {
        return park(hw, td, TdState::ReceiveStartSplit, periodic);
    }

    td.hcsplt.remove(HcSplt::COMPSPLT);
    td.curr_frame = uf;
    td.nyet_count = 0;
    td.state = TdState::WaitStartSplitAck;
    let pid = data_pid(td);
    let mps = td.max_packet as usize;
    issue(hw, td, ch, mps, pid, true);
    Step::Busy
}

fn receive_data<P: RegisterPort>(hw: &mut IrqDomain<P>, td: &mut Descriptor, ch: usize, tmr: u8) -> Step {
    if td.is_split() {
        let uf = current_microframe(hw);
        if uf == td.curr_frame {
            hw.sof_wanted = true;
            return park(hw, td, TdState::ReceiveData, false);
        }
        td.hcsplt |= HcSplt::COMPSPLT;
        td.curr_frame = uf;
        td.state = TdState::WaitCompleteSplitAck;
    } else {
        if rate_limited(hw, td, tmr) {
            let periodic = td.ep_type.is_periodic();
            return park(hw, td, TdState::ReceiveData, periodic);
        }
        td.state = TdState::WaitAckNoError;
    }

    let pid = data_pid(td);
    let mps = td.max_packet as usize;
    issue(hw, td, ch, mps, pid, true);
    Step::Busy
}
