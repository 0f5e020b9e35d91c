//! Scripted DWC OTG core for host-side tests
//!
//! Models the registers the engine touches: channels stay enabled until a
//! test injects a handshake, HCINT and the port change flags are
//! write-1-to-clear, received packets queue behind GRXSTSP, and every channel
//! enable is recorded with the HCSPLT/HCTSIZ it was programmed with.

use std::collections::{BTreeMap, VecDeque};

use dwc_otg_usbh::otg::{
    self, grxsts, hctsiz, GintSts, GrstCtl, HcChar, HcInt, HcSplt, Hprt, RegisterPort, GHWCFG2, GHWCFG3, GINTMSK,
    GINTSTS, GRSTCTL, GRXSTSP, GSNPSID, HFNUM, HPRT, MAX_HOST_CHANNELS,
};

/// HPRT change flags, write-1-to-clear
const PORT_CHANGE: u32 = Hprt::PRTCONNDET.bits() | Hprt::PRTENCHNG.bits() | Hprt::PRTOVRCURRCHNG.bits();

/// One channel enable as seen by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issue {
    pub channel: usize,
    pub hcchar: u32,
    pub hcsplt: u32,
    pub hctsiz: u32,
}

impl Issue {
    pub fn is_in(&self) -> bool {
        self.hcchar & HcChar::EPDIR_IN.bits() != 0
    }

    pub fn pid(&self) -> u32 {
        hctsiz::pid(self.hctsiz)
    }

    pub fn bytes(&self) -> usize {
        hctsiz::bytes(self.hctsiz) as usize
    }

    pub fn is_split(&self) -> bool {
        self.hcsplt & HcSplt::SPLTENA.bits() != 0
    }

    pub fn is_complete_split(&self) -> bool {
        self.hcsplt & HcSplt::COMPSPLT.bits() != 0
    }
}

/// Register-level model of the core
pub struct MockPort {
    pub hcchar: [u32; MAX_HOST_CHANNELS],
    pub hcsplt: [u32; MAX_HOST_CHANNELS],
    pub hctsiz: [u32; MAX_HOST_CHANNELS],
    pub hcint: [u32; MAX_HOST_CHANNELS],
    /// Words written to each channel's transmit window
    pub tx: [Vec<u32>; MAX_HOST_CHANNELS],
    /// Every channel enable in order
    pub issues: Vec<Issue>,
    /// Every write that requested a channel disable
    pub disables: Vec<usize>,
    pub hfnum: u32,
    pub hprt: u32,
    /// Sticky global status bits (SOF)
    pub gintsts: u32,
    pub gintmsk: u32,
    pub rx_status: VecDeque<u32>,
    pub rx_words: VecDeque<u32>,
    /// GRSTCTL never reports AHB idle when false
    pub ahb_idle: bool,
    pub channel_count: usize,
    regs: BTreeMap<usize, u32>,
}

impl MockPort {
    pub fn new(channel_count: usize) -> Self {
        Self {
            hcchar: [0; MAX_HOST_CHANNELS],
            hcsplt: [0; MAX_HOST_CHANNELS],
            hctsiz: [0; MAX_HOST_CHANNELS],
            hcint: [0; MAX_HOST_CHANNELS],
            tx: Default::default(),
            issues: Vec::new(),
            disables: Vec::new(),
            hfnum: 1,
            hprt: 0,
            gintsts: 0,
            gintmsk: 0,
            rx_status: VecDeque::new(),
            rx_words: VecDeque::new(),
            ahb_idle: true,
            channel_count,
            regs: BTreeMap::new(),
        }
    }

    /// Channels currently enabled in hardware
    pub fn enabled_channels(&self) -> Vec<usize> {
        (0..self.channel_count)
            .filter(|ch| self.hcchar[*ch] & HcChar::CHENA.bits() != 0)
            .collect()
    }

    /// The single channel currently enabled
    pub fn active_channel(&self) -> usize {
        let enabled = self.enabled_channels();
        assert_eq!(enabled.len(), 1, "expected exactly one enabled channel, got {enabled:?}");
        enabled[0]
    }

    /// Most recent channel enable
    pub fn last_issue(&self) -> Issue {
        *self.issues.last().expect("nothing issued")
    }

    /// Halt `ch` with the given handshake
    pub fn handshake(&mut self, ch: usize, bits: HcInt) {
        self.hcchar[ch] &= !HcChar::CHENA.bits();
        self.hcint[ch] |= (bits | HcInt::CHHLTD).bits();
    }

    /// Halt the active channel with the given handshake
    pub fn respond(&mut self, bits: HcInt) -> usize {
        let ch = self.active_channel();
        self.handshake(ch, bits);
        ch
    }

    /// Deliver an IN data packet on the active channel and ACK it
    pub fn respond_data(&mut self, data: &[u8]) -> usize {
        let ch = self.active_channel();
        self.rx_status.push_back(grxsts::encode(ch, data.len(), 0, grxsts::PKTSTS_IN_DATA));
        for chunk in data.chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            self.rx_words.push_back(u32::from_le_bytes(w));
        }
        self.rx_status.push_back(grxsts::encode(ch, 0, 0, grxsts::PKTSTS_IN_COMPLETE));
        self.handshake(ch, HcInt::ACK | HcInt::XFERCOMPL);
        ch
    }

    /// Bytes pushed to `ch`'s transmit window, trimmed to the last programmed size
    pub fn sent(&self, ch: usize, len: usize) -> Vec<u8> {
        let bytes: Vec<u8> = self.tx[ch].iter().flat_map(|w| w.to_le_bytes()).collect();
        let start = bytes.len().saturating_sub(len.div_ceil(4) * 4);
        bytes[start..start + len].to_vec()
    }

    /// Raise a root port change
    pub fn port_event(&mut self, hprt: Hprt) {
        self.hprt = hprt.bits();
    }

    /// Pretend a frame boundary passed
    pub fn start_of_frame(&mut self) {
        self.hfnum = self.hfnum.wrapping_add(1);
        self.gintsts |= GintSts::SOF.bits();
    }

    fn channel_register(offset: usize) -> Option<(usize, usize)> {
        let base = otg::hcchar(0);
        let end = otg::hcchar(MAX_HOST_CHANNELS);
        (base..end).contains(&offset).then(|| ((offset - base) / 0x20, (offset - base) % 0x20))
    }
}

impl RegisterPort for MockPort {
    fn read(&mut self, offset: usize) -> u32 {
        if let Some((ch, reg)) = Self::channel_register(offset) {
            return match reg {
                0x00 => self.hcchar[ch],
                0x04 => self.hcsplt[ch],
                0x08 => self.hcint[ch],
                0x10 => self.hctsiz[ch],
                _ => 0,
            };
        }
        match offset {
            GINTSTS => {
                let mut sts = self.gintsts | GintSts::CURMOD.bits();
                if !self.rx_status.is_empty() {
                    sts |= GintSts::RXFLVL.bits();
                }
                if self.hcint.iter().any(|v| *v != 0) {
                    sts |= GintSts::HCHINT.bits();
                }
                if self.hprt & PORT_CHANGE != 0 {
                    sts |= GintSts::PRTINT.bits();
                }
                sts
            }
            GINTMSK => self.gintmsk,
            GRXSTSP => self.rx_status.pop_front().unwrap_or(0),
            GRSTCTL => {
                if self.ahb_idle {
                    GrstCtl::AHBIDLE.bits()
                } else {
                    0
                }
            }
            GSNPSID => 0x4F54_420A,
            GHWCFG2 => ((self.channel_count as u32 - 1) & 0xF) << 14,
            GHWCFG3 => 1024 << 16,
            HFNUM => self.hfnum,
            HPRT => self.hprt,
            o if o == otg::dfifo(0) => self.rx_words.pop_front().unwrap_or(0),
            o => self.regs.get(&o).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        if let Some((ch, reg)) = Self::channel_register(offset) {
            match reg {
                0x00 if value & HcChar::CHDIS.bits() != 0 => {
                    // Halts immediately
                    self.hcchar[ch] &= !(HcChar::CHENA | HcChar::CHDIS).bits();
                    self.disables.push(ch);
                }
                0x00 => {
                    self.hcchar[ch] = value;
                    if value & HcChar::CHENA.bits() != 0 {
                        self.issues.push(Issue {
                            channel: ch,
                            hcchar: value,
                            hcsplt: self.hcsplt[ch],
                            hctsiz: self.hctsiz[ch],
                        });
                    }
                }
                0x04 => self.hcsplt[ch] = value,
                0x08 => self.hcint[ch] &= !value,
                0x10 => self.hctsiz[ch] = value,
                _ => {}
            }
            return;
        }
        match offset {
            GINTSTS => self.gintsts &= !value,
            GINTMSK => self.gintmsk = value,
            HPRT => {
                self.hprt &= !(value & PORT_CHANGE);
                if value & Hprt::PRTENA.bits() != 0 {
                    self.hprt &= !Hprt::PRTENA.bits();
                }
                let control = (Hprt::PRTPWR | Hprt::PRTRST | Hprt::PRTSUSP | Hprt::PRTRES).bits();
                self.hprt = (self.hprt & !control) | (value & control);
            }
            o if o >= otg::dfifo(0) && o < otg::dfifo(MAX_HOST_CHANNELS) => {
                let ch = o / 0x1000 - 1;
                self.tx[ch].push(value);
            }
            o => {
                self.regs.insert(o, value);
            }
        }
    }
}

/// Delay provider that returns immediately
pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}
