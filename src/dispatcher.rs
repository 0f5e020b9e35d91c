//! Interrupt/poll dispatcher
//!
//! [`IrqDomain`] is everything the register-touching path owns: the port,
//! the channel table and the FIFO engine. [`interrupt`] is the bounded work
//! done in true interrupt context; [`service`] drains channel and FIFO status
//! and runs the protocol for every active transfer.

use crate::channel::ChannelTable;
use crate::fifo::{Fetch, FifoEngine};
use crate::otg::controller::{acknowledge_port_change, update_frame_interval, PortStatus};
use crate::otg::{self, GintSts, HcInt, RegisterPort, GINTMSK, GINTSTS};
use crate::perf::PerfCounters;
use crate::transfer::{Completion, TransferDomain};

/// State owned by the fine-grained (interrupt) lock
pub struct IrqDomain<P: RegisterPort> {
    /// Register port
    pub port: P,
    /// Hardware channel table
    pub channels: ChannelTable,
    /// Shared receive path and transmit helper
    pub fifo: FifoEngine,
    /// Consecutive transaction errors tolerated per descriptor
    pub max_errors: u8,
    /// A descriptor parked for a later microframe during this pass
    pub sof_wanted: bool,
    /// Channel acquisitions that found no free channel
    pub(crate) exhausted: u32,
    sof_enabled: bool,
    port_change: Option<PortStatus>,
}

impl<P: RegisterPort> IrqDomain<P> {
    /// Wrap a running core with `channel_count` host channels
    pub fn new(port: P, channel_count: usize, max_errors: u8) -> Self {
        Self {
            port,
            channels: ChannelTable::new(channel_count),
            fifo: FifoEngine::new(),
            max_errors: max_errors.max(1),
            sof_wanted: false,
            exhausted: 0,
            sof_enabled: false,
            port_change: None,
        }
    }

    /// SOF interrupt currently unmasked
    #[inline(always)]
    pub const fn sof_enabled(&self) -> bool {
        self.sof_enabled
    }

    /// Take the last root port change seen by the dispatcher
    pub fn take_port_change(&mut self) -> Option<PortStatus> {
        self.port_change.take()
    }

    /// Read, acknowledge and accumulate HCINTn for every channel
    ///
    /// Returns `true` if any channel reported something.
    pub fn latch_channels(&mut self) -> bool {
        let mut any = false;
        for ch in 0..self.channels.count() {
            let raw = self.port.read(otg::hcint(ch));
            if raw == 0 {
                continue;
            }
            self.port.write(otg::hcint(ch), raw);
            // The software-only bit is never set by hardware
            let bits = HcInt::from_bits_retain(raw).difference(HcInt::SOFTWARE_ONLY);
            self.channels.latch(ch, bits);
            any = true;
        }
        any
    }

    /// Handle SOF and root port status, acknowledging both
    fn handle_global(&mut self, status: GintSts) {
        if status.contains(GintSts::SOF) {
            self.port.write(GINTSTS, GintSts::SOF.bits());
            self.channels.sof_tick();
        }
        if status.contains(GintSts::PRTINT) {
            let port = acknowledge_port_change(&mut self.port);
            if port.enable_changed && port.enabled {
                update_frame_interval(&mut self.port, port.speed);
            }
            #[cfg(feature = "defmt")]
            defmt::info!("port change: connected={} enabled={}", port.connected, port.enabled);
            self.port_change = Some(port);
        }
    }

    /// Pending and unmasked core interrupts
    fn pending(&mut self) -> GintSts {
        let sts = self.port.read(GINTSTS);
        let msk = self.port.read(GINTMSK);
        GintSts::from_bits_retain(sts & msk)
    }

    fn set_rxflvl_mask(&mut self, enabled: bool) {
        if enabled {
            self.port.set_bits(GINTMSK, GintSts::RXFLVL.bits());
        } else {
            self.port.clear_bits(GINTMSK, GintSts::RXFLVL.bits());
        }
    }

    /// Unmask SOF only while a channel counts down or a descriptor is parked
    fn update_sof(&mut self) {
        let want = self.sof_wanted || self.channels.needs_sof();
        if want == self.sof_enabled {
            return;
        }
        if want {
            self.port.write(GINTSTS, GintSts::SOF.bits());
            self.port.set_bits(GINTMSK, GintSts::SOF.bits());
        } else {
            self.port.clear_bits(GINTMSK, GintSts::SOF.bits());
        }
        self.sof_enabled = want;

        #[cfg(feature = "defmt")]
        defmt::trace!("SOF interrupt {}", if want { "on" } else { "off" });
    }
}

/// Interrupt-context work: acknowledge and latch, never run the protocol
///
/// The receive-level interrupt is masked until [`service`] has drained the
/// FIFO. Returns `true` when deferred servicing is needed.
pub fn interrupt<P: RegisterPort>(hw: &mut IrqDomain<P>) -> bool {
    let status = hw.pending();
    if status.is_empty() {
        return false;
    }
    if status.contains(GintSts::RXFLVL) {
        hw.set_rxflvl_mask(false);
    }
    if status.contains(GintSts::HCHINT) {
        hw.latch_channels();
    }
    hw.handle_global(status);
    true
}

/// One full dispatcher pass
///
/// Latches channel status, pulls received packets one at a time and pumps
/// every active transfer until the receive path is empty. Returns the number
/// of transfers that completed.
pub fn service<P: RegisterPort>(
    hw: &mut IrqDomain<P>,
    xfers: &mut TransferDomain,
    tmr_val: u8,
    perf: &PerfCounters,
    out: &mut impl FnMut(Completion),
) -> usize {
    hw.sof_wanted = false;
    let status = hw.pending();
    hw.handle_global(status);

    let mut finished = 0;
    loop {
        hw.latch_channels();
        let fetched = hw.fifo.fetch(&mut hw.port, hw.channels.rx_routing());
        finished += xfers.service(hw, tmr_val, out);

        if matches!(fetched, Fetch::Empty) {
            break;
        }
        if let Some(pkt) = hw.fifo.latched() {
            // Nobody consumed it: the owner moved on or was aborted
            hw.fifo.discard();
            perf.record_rx_discard();
            #[cfg(feature = "defmt")]
            defmt::debug!("CH{}: unconsumed rx packet discarded ({} bytes)", pkt.channel, pkt.bytes);
            #[cfg(not(feature = "defmt"))]
            let _ = pkt;
        }
    }

    if hw.fifo.latched().is_none() {
        hw.set_rxflvl_mask(true);
    }
    if hw.exhausted != 0 {
        perf.record_channel_exhaustion(hw.exhausted);
        hw.exhausted = 0;
    }
    hw.update_sof();
    finished
}

#[cfg(test)]
mod tests {
    use super::*;

    /// GINTSTS/GINTMSK plus per-channel HCINT with write-1-to-clear
    struct StatusPort {
        gintsts: u32,
        gintmsk: u32,
        hcint: [u32; 4],
        hprt: u32,
    }

    impl StatusPort {
        fn new() -> Self {
            Self { gintsts: 0, gintmsk: 0, hcint: [0; 4], hprt: 0 }
        }
    }

    impl RegisterPort for StatusPort {
        fn read(&mut self, offset: usize) -> u32 {
            match offset {
                GINTSTS => self.gintsts,
                GINTMSK => self.gintmsk,
                otg::HPRT => self.hprt,
                o if (0x508..0x588).contains(&o) && (o - 0x508) % 0x20 == 0 => self.hcint[(o - 0x508) / 0x20],
                _ => 0,
            }
        }

        fn write(&mut self, offset: usize, value: u32) {
            match offset {
                GINTSTS => self.gintsts &= !value,
                GINTMSK => self.gintmsk = value,
                otg::HPRT => self.hprt &= !(value & 0x2A),
                o if (0x508..0x588).contains(&o) && (o - 0x508) % 0x20 == 0 => {
                    self.hcint[(o - 0x508) / 0x20] &= !value;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_latch_clears_hardware_and_accumulates() {
        let mut hw = IrqDomain::new(StatusPort::new(), 4, 3);
        hw.port.hcint[2] = (HcInt::NAK | HcInt::CHHLTD).bits();
        assert!(hw.latch_channels());
        assert_eq!(hw.port.hcint[2], 0);
        hw.port.hcint[2] = HcInt::ACK.bits();
        hw.latch_channels();
        assert_eq!(hw.channels.hcint(2), HcInt::NAK | HcInt::CHHLTD | HcInt::ACK);
        assert!(!hw.latch_channels());
    }

    #[test]
    fn test_interrupt_masks_rxflvl_until_serviced() {
        let mut hw = IrqDomain::new(StatusPort::new(), 4, 3);
        hw.port.gintmsk = (GintSts::RXFLVL | GintSts::HCHINT).bits();
        hw.port.gintsts = GintSts::RXFLVL.bits();
        assert!(interrupt(&mut hw));
        assert_eq!(hw.port.gintmsk & GintSts::RXFLVL.bits(), 0);

        // Receive path empty once serviced
        hw.port.gintsts = 0;
        let mut xfers = TransferDomain::new(crate::otg::HostConfig::new());
        let perf = PerfCounters::new();
        service(&mut hw, &mut xfers, 0, &perf, &mut |_| {});
        assert_ne!(hw.port.gintmsk & GintSts::RXFLVL.bits(), 0);
    }

    #[test]
    fn test_sof_enabled_only_while_needed() {
        let mut hw = IrqDomain::new(StatusPort::new(), 4, 3);
        let mut xfers = TransferDomain::new(crate::otg::HostConfig::new());
        let perf = PerfCounters::new();

        hw.port.hcint[1] = 0;
        // Simulate a disable in flight on channel 1
        let mut td = crate::descriptor::Descriptor::new(
            crate::descriptor::TdKind::DataTx,
            crate::transfer::TransferType::Bulk,
            otg::HcChar::endpoint(64, 1, 1, 2, false),
            64,
        );
        hw.channels.acquire(&mut hw.fifo, &mut td);
        struct Enabled;
        impl RegisterPort for Enabled {
            fn read(&mut self, _offset: usize) -> u32 {
                otg::HcChar::CHENA.bits()
            }
            fn write(&mut self, _offset: usize, _value: u32) {}
        }
        hw.channels.release(&mut Enabled, &mut hw.fifo, &mut td);

        service(&mut hw, &mut xfers, 0, &perf, &mut |_| {});
        assert!(hw.sof_enabled());
        assert_ne!(hw.port.gintmsk & GintSts::SOF.bits(), 0);

        for _ in 0..2 {
            hw.port.gintsts |= GintSts::SOF.bits();
            interrupt(&mut hw);
        }
        service(&mut hw, &mut xfers, 0, &perf, &mut |_| {});
        assert!(!hw.sof_enabled());
        assert_eq!(hw.port.gintmsk & GintSts::SOF.bits(), 0);
    }

    #[test]
    fn test_port_change_latched() {
        let mut hw = IrqDomain::new(StatusPort::new(), 4, 3);
        hw.port.gintmsk = GintSts::PRTINT.bits();
        hw.port.gintsts = GintSts::PRTINT.bits();
        hw.port.hprt = (otg::Hprt::PRTCONNSTS | otg::Hprt::PRTCONNDET).bits();
        assert!(interrupt(&mut hw));
        let change = hw.take_port_change().unwrap();
        assert!(change.connected);
        assert!(change.connect_changed);
        assert_eq!(hw.port.hprt & otg::Hprt::PRTCONNDET.bits(), 0);
        assert!(hw.take_port_change().is_none());
    }
}
