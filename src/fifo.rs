//! Shared receive FIFO and per-channel transmit path
//!
//! In slave mode every IN packet for every channel arrives through one receive
//! FIFO, announced by a status word popped from GRXSTSP. At most one packet is
//! held here at a time: it stays latched until the descriptor owning the
//! channel consumes it, or the dispatcher discards it.

use crate::error::UsbError;
use crate::otg::{grxsts, GintSts, RegisterPort, GINTSTS, GRXSTSP};

/// Largest packet the bounce buffer holds (high-speed bulk/isochronous)
pub const MAX_PACKET_SIZE: usize = 1024;

/// A received packet waiting in the bounce buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxPacket {
    /// Channel the packet arrived on
    pub channel: usize,
    /// Payload length
    pub bytes: usize,
    /// Data PID reported by the core
    pub dpid: u32,
}

/// Outcome of trying to pull the next status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fetch {
    /// A data packet is latched for a routed channel
    Latched(RxPacket),
    /// A packet was already latched from an earlier pass
    AlreadyLatched,
    /// Receive path is empty
    Empty,
}

/// Result of a descriptor claiming the latched packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Received {
    /// Bytes copied out
    pub bytes: usize,
    /// Packet shorter than the max packet size
    pub short: bool,
}

/// Receive status latch, bounce buffer and transmit helper
pub struct FifoEngine {
    latched: Option<RxPacket>,
    bounce: [u8; MAX_PACKET_SIZE],
    discarded: u32,
}

impl FifoEngine {
    /// Create an empty engine
    pub const fn new() -> Self {
        Self {
            latched: None,
            bounce: [0; MAX_PACKET_SIZE],
            discarded: 0,
        }
    }

    /// Packet currently latched
    #[inline(always)]
    pub const fn latched(&self) -> Option<RxPacket> {
        self.latched
    }

    /// Packets dropped since creation
    #[inline(always)]
    pub const fn discarded(&self) -> u32 {
        self.discarded
    }

    /// Pull status words until a deliverable data packet is latched
    ///
    /// Non-data status words are skipped. Data for channels outside `routing`
    /// (aborted or already released) is read out and dropped. Nothing is popped
    /// while a packet is still latched.
    pub fn fetch<P: RegisterPort>(&mut self, port: &mut P, routing: u16) -> Fetch {
        if self.latched.is_some() {
            return Fetch::AlreadyLatched;
        }
        loop {
            let gintsts = GintSts::from_bits_retain(port.read(GINTSTS));
            if !gintsts.contains(GintSts::RXFLVL) {
                return Fetch::Empty;
            }
            let status = port.read(GRXSTSP);
            let pkt = RxPacket {
                channel: grxsts::channel(status),
                bytes: grxsts::byte_count(status),
                dpid: grxsts::dpid(status),
            };

            if grxsts::packet_status(status) != grxsts::PKTSTS_IN_DATA {
                continue;
            }
            let len = pkt.bytes.min(MAX_PACKET_SIZE);
            if len != 0 {
                port.read_fifo(&mut self.bounce[..len]);
            }
            // Words beyond the bounce buffer still have to leave the FIFO
            let extra_words = pkt.bytes.div_ceil(4) - len.div_ceil(4);
            for _ in 0..extra_words {
                let _ = port.read(crate::otg::dfifo(0));
            }

            if routing & (1 << pkt.channel) == 0 {
                self.discarded = self.discarded.wrapping_add(1);
                #[cfg(feature = "defmt")]
                defmt::debug!("CH{}: rx packet for idle channel dropped", pkt.channel);
                continue;
            }
            self.latched = Some(pkt);
            return Fetch::Latched(pkt);
        }
    }

    /// Release the latched packet once it was consumed
    #[inline(always)]
    pub fn ack(&mut self) {
        self.latched = None;
    }

    /// Drop the latched packet unconsumed
    pub fn discard(&mut self) {
        if self.latched.take().is_some() {
            self.discarded = self.discarded.wrapping_add(1);
        }
    }

    /// Drop the latched packet if it belongs to `ch`
    pub fn ack_channel(&mut self, ch: usize) -> bool {
        match self.latched {
            Some(p) if p.channel == ch => {
                self.latched = None;
                true
            }
            _ => false,
        }
    }

    /// Hand the latched packet on `ch` to a descriptor's buffer
    ///
    /// Returns `None` when nothing is latched for `ch`. A packet larger than
    /// the max packet size or than `dst` is a framing error; the packet is
    /// consumed either way.
    pub fn take(&mut self, ch: usize, dst: &mut [u8], max_packet: usize) -> Option<Result<Received, UsbError>> {
        let pkt = self.latched.filter(|p| p.channel == ch)?;
        self.latched = None;

        if pkt.bytes > max_packet || pkt.bytes > dst.len() || pkt.bytes > MAX_PACKET_SIZE {
            return Some(Err(UsbError::BufferOverflow));
        }
        dst[..pkt.bytes].copy_from_slice(&self.bounce[..pkt.bytes]);
        Some(Ok(Received {
            bytes: pkt.bytes,
            short: pkt.bytes < max_packet,
        }))
    }

    /// Push one packet to a channel's transmit window
    ///
    /// The channel must already be enabled. Returns the byte count the
    /// caller should account for on ACK.
    pub fn transmit<P: RegisterPort>(&mut self, port: &mut P, ch: usize, data: &[u8]) -> usize {
        if !data.is_empty() {
            port.write_fifo(ch, data);
        }
        data.len()
    }
}

impl Default for FifoEngine {
    fn default() -> Self {
        Self::new()
    }
}
