//! DesignWare USB 2.0 OTG core, host-mode register map
//!
//! Offsets and bit definitions for the subset of the core used in host mode.
//! Every access goes through a [`RegisterPort`], so the transfer engine never
//! touches memory-mapped I/O directly.
//!
//! # Register Memory Layout
//!
//! - Global registers (offset 0x000-0x0FF)
//! - Host global registers (offset 0x400-0x43F) and the port register at 0x440
//! - Host channel registers, 0x20 bytes per channel starting at 0x500
//! - Per-channel data FIFO windows, 0x1000 bytes each starting at 0x1000

pub mod register;
pub mod controller;

pub use register::{MmioPort, RegisterPort, RegisterTimeout};
pub use controller::{
    HostConfig, HostConfigBuilder, Initialized, OtgController, PortSpeed, PortStatus, Running,
    Uninitialized,
};

use bitflags::bitflags;

/// Hard upper bound on host channels in any DWC OTG configuration
pub const MAX_HOST_CHANNELS: usize = 16;

/// OTG control and status
pub const GOTGCTL: usize = 0x000;
/// AHB configuration
pub const GAHBCFG: usize = 0x008;
/// USB configuration
pub const GUSBCFG: usize = 0x00C;
/// Reset control
pub const GRSTCTL: usize = 0x010;
/// Core interrupt status
pub const GINTSTS: usize = 0x014;
/// Core interrupt mask
pub const GINTMSK: usize = 0x018;
/// Receive status debug read (peek)
pub const GRXSTSR: usize = 0x01C;
/// Receive status read and pop
pub const GRXSTSP: usize = 0x020;
/// Receive FIFO size
pub const GRXFSIZ: usize = 0x024;
/// Non-periodic transmit FIFO size
pub const GNPTXFSIZ: usize = 0x028;
/// Synopsys core id
pub const GSNPSID: usize = 0x040;
/// Hardware configuration 2 (channel count)
pub const GHWCFG2: usize = 0x048;
/// Hardware configuration 3 (total FIFO depth)
pub const GHWCFG3: usize = 0x04C;
/// Host periodic transmit FIFO size
pub const HPTXFSIZ: usize = 0x100;
/// Host configuration
pub const HCFG: usize = 0x400;
/// Host frame interval
pub const HFIR: usize = 0x404;
/// Host frame number / frame time remaining
pub const HFNUM: usize = 0x408;
/// Host all-channels interrupt
pub const HAINT: usize = 0x414;
/// Host all-channels interrupt mask
pub const HAINTMSK: usize = 0x418;
/// Host port control and status
pub const HPRT: usize = 0x440;
/// Power and clock gating control
pub const PCGCCTL: usize = 0xE00;

/// Core id signature in the upper half of GSNPSID ("OT")
pub const SNPSID_SIGNATURE: u32 = 0x4F54;

/// Host channel characteristics
#[inline(always)]
pub const fn hcchar(ch: usize) -> usize {
    0x500 + ch * 0x20
}

/// Host channel split control
#[inline(always)]
pub const fn hcsplt(ch: usize) -> usize {
    0x504 + ch * 0x20
}

/// Host channel interrupt
#[inline(always)]
pub const fn hcint(ch: usize) -> usize {
    0x508 + ch * 0x20
}

/// Host channel interrupt mask
#[inline(always)]
pub const fn hcintmsk(ch: usize) -> usize {
    0x50C + ch * 0x20
}

/// Host channel transfer size
#[inline(always)]
pub const fn hctsiz(ch: usize) -> usize {
    0x510 + ch * 0x20
}

/// Data FIFO window for a channel (reads always pop the shared RX FIFO)
#[inline(always)]
pub const fn dfifo(ch: usize) -> usize {
    0x1000 + ch * 0x1000
}

bitflags! {
    /// AHB configuration (GAHBCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GahbCfg: u32 {
        /// Global interrupt mask (1 = interrupts delivered)
        const GLBLINTRMSK = 1 << 0;
        /// Non-periodic TX FIFO empty level (1 = completely empty)
        const NPTXFEMPLVL = 1 << 7;
        /// Periodic TX FIFO empty level
        const PTXFEMPLVL = 1 << 8;
    }
}

bitflags! {
    /// USB configuration (GUSBCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GusbCfg: u32 {
        /// PHY interface width, 16 bit
        const PHYIF = 1 << 3;
        /// ULPI or UTMI+ select
        const ULPI_UTMI_SEL = 1 << 4;
        /// Full-speed serial transceiver select
        const PHYSEL = 1 << 6;
        /// Force host mode
        const FORCEHOSTMODE = 1 << 29;
        /// Force device mode
        const FORCEDEVMODE = 1 << 30;
    }
}

bitflags! {
    /// Reset control (GRSTCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrstCtl: u32 {
        /// Core soft reset, self-clearing
        const CSFTRST = 1 << 0;
        /// RX FIFO flush, self-clearing
        const RXFFLSH = 1 << 4;
        /// TX FIFO flush, self-clearing
        const TXFFLSH = 1 << 5;
        /// TX FIFO number field - Bits [10:6]
        const TXFNUM_MASK = 0x1F << 6;
        /// TX FIFO number 0x10 selects every FIFO
        const TXFNUM_ALL = 0x10 << 6;
        /// AHB master idle
        const AHBIDLE = 1 << 31;
    }
}

bitflags! {
    /// Core interrupt status and mask (GINTSTS / GINTMSK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GintSts: u32 {
        /// Current mode of operation (1 = host)
        const CURMOD = 1 << 0;
        /// Mode mismatch
        const MODEMIS = 1 << 1;
        /// OTG interrupt
        const OTGINT = 1 << 2;
        /// Start of (micro)frame
        const SOF = 1 << 3;
        /// RX FIFO non-empty
        const RXFLVL = 1 << 4;
        /// Non-periodic TX FIFO empty
        const NPTXFEMP = 1 << 5;
        /// Incomplete periodic transfer
        const INCOMPLP = 1 << 21;
        /// Host port interrupt
        const PRTINT = 1 << 24;
        /// Host channels interrupt
        const HCHINT = 1 << 25;
        /// Periodic TX FIFO empty
        const PTXFEMP = 1 << 26;
        /// Connector id status change
        const CONIDSTSCHNG = 1 << 28;
        /// Disconnect detected
        const DISCONNINT = 1 << 29;
    }
}

bitflags! {
    /// Host configuration (HCFG)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HCfg: u32 {
        /// FS/LS PHY clock select - Bits [1:0]
        const FSLSPCLKSEL_MASK = 0b11;
        /// 30/60 MHz PHY clock
        const FSLSPCLKSEL_30_60 = 0b00;
        /// 48 MHz PHY clock
        const FSLSPCLKSEL_48 = 0b01;
        /// 6 MHz PHY clock (low-speed)
        const FSLSPCLKSEL_6 = 0b10;
        /// FS/LS only support
        const FSLSSUPP = 1 << 2;
    }
}

bitflags! {
    /// Host port control and status (HPRT)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Hprt: u32 {
        /// Device attached
        const PRTCONNSTS = 1 << 0;
        /// Connect detected (write 1 to clear)
        const PRTCONNDET = 1 << 1;
        /// Port enabled (write 1 disables)
        const PRTENA = 1 << 2;
        /// Enable changed (write 1 to clear)
        const PRTENCHNG = 1 << 3;
        /// Over-current active
        const PRTOVRCURRACT = 1 << 4;
        /// Over-current changed (write 1 to clear)
        const PRTOVRCURRCHNG = 1 << 5;
        /// Resume signalling
        const PRTRES = 1 << 6;
        /// Suspended
        const PRTSUSP = 1 << 7;
        /// Reset signalling
        const PRTRST = 1 << 8;
        /// Line status - Bits [11:10]
        const PRTLNSTS_MASK = 0b11 << 10;
        /// Port power
        const PRTPWR = 1 << 12;
        /// Port speed - Bits [18:17]
        const PRTSPD_MASK = 0b11 << 17;

        /// Bits that must be written as zero to avoid side effects
        const W1C_MASK = Self::PRTCONNDET.bits()
            | Self::PRTENA.bits()
            | Self::PRTENCHNG.bits()
            | Self::PRTOVRCURRCHNG.bits();
    }
}

impl Hprt {
    /// Port speed field (0 high, 1 full, 2 low)
    pub const fn speed_bits(self) -> u32 {
        (self.bits() >> 17) & 0b11
    }
}

bitflags! {
    /// Host channel characteristics (HCCHARn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcChar: u32 {
        /// Maximum packet size - Bits [10:0]
        const MPS_MASK = 0x7FF;
        /// Endpoint number - Bits [14:11]
        const EPNUM_MASK = 0xF << 11;
        /// Endpoint direction, 1 = IN
        const EPDIR_IN = 1 << 15;
        /// Low-speed device
        const LSPDDEV = 1 << 17;
        /// Endpoint type - Bits [19:18]
        const EPTYPE_MASK = 0b11 << 18;
        /// Multi count - Bits [21:20]
        const MC_MASK = 0b11 << 20;
        /// Device address - Bits [28:22]
        const DEVADDR_MASK = 0x7F << 22;
        /// Odd frame (periodic transfers)
        const ODDFRM = 1 << 29;
        /// Channel disable request
        const CHDIS = 1 << 30;
        /// Channel enable
        const CHENA = 1 << 31;
    }
}

impl HcChar {
    /// Compose the static part of the characteristics word for one endpoint
    pub const fn endpoint(mps: u16, ep: u8, dev_addr: u8, ep_type: u32, low_speed: bool) -> Self {
        let mut bits = (mps as u32 & 0x7FF)
            | ((ep as u32 & 0xF) << 11)
            | ((ep_type & 0b11) << 18)
            | (1 << 20)
            | ((dev_addr as u32 & 0x7F) << 22);
        if low_speed {
            bits |= 1 << 17;
        }
        Self::from_bits_retain(bits)
    }
}

bitflags! {
    /// Host channel split control (HCSPLTn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcSplt: u32 {
        /// Hub port - Bits [6:0]
        const PRTADDR_MASK = 0x7F;
        /// Hub address - Bits [13:7]
        const HUBADDR_MASK = 0x7F << 7;
        /// Transaction position - Bits [15:14]
        const XACTPOS_MASK = 0b11 << 14;
        /// Whole payload in this start-split
        const XACTPOS_ALL = 0b11 << 14;
        /// First part of the payload
        const XACTPOS_BEGIN = 0b10 << 14;
        /// Last part of the payload
        const XACTPOS_END = 0b01 << 14;
        /// Issue a complete-split rather than a start-split
        const COMPSPLT = 1 << 16;
        /// Split enable
        const SPLTENA = 1 << 31;
    }
}

impl HcSplt {
    /// Start-split word addressing a hub port
    pub const fn hub(hub_addr: u8, hub_port: u8) -> Self {
        Self::from_bits_retain(
            (1 << 31) | (hub_port as u32 & 0x7F) | ((hub_addr as u32 & 0x7F) << 7),
        )
    }
}

bitflags! {
    /// Host channel interrupt (HCINTn), also used as the latched condition set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HcInt: u32 {
        /// Transfer completed
        const XFERCOMPL = 1 << 0;
        /// Channel halted
        const CHHLTD = 1 << 1;
        /// AHB error
        const AHBERR = 1 << 2;
        /// STALL response
        const STALL = 1 << 3;
        /// NAK response
        const NAK = 1 << 4;
        /// ACK response
        const ACK = 1 << 5;
        /// NYET response
        const NYET = 1 << 6;
        /// Transaction error
        const XACTERR = 1 << 7;
        /// Babble error
        const BBLERR = 1 << 8;
        /// Frame overrun
        const FRMOVRUN = 1 << 9;
        /// Data toggle error
        const DATATGLERR = 1 << 10;
        /// Set by software when a packet was drained from the RX FIFO
        const SOFTWARE_ONLY = 1 << 20;

        /// Transaction-level errors subject to the retry budget
        const ERRORS = Self::BBLERR.bits() | Self::XACTERR.bits() | Self::DATATGLERR.bits();
        /// Retry conditions (frame overrun counts as a NAK)
        const RETRY = Self::NAK.bits() | Self::FRMOVRUN.bits();
        /// Default per-channel mask programmed at init
        const DEFAULT_MASK = Self::STALL.bits()
            | Self::NAK.bits()
            | Self::ACK.bits()
            | Self::NYET.bits()
            | Self::XACTERR.bits()
            | Self::BBLERR.bits()
            | Self::FRMOVRUN.bits()
            | Self::DATATGLERR.bits()
            | Self::CHHLTD.bits();
    }
}

/// Transfer size register (HCTSIZn) encoding
pub mod hctsiz {
    /// PID DATA0
    pub const PID_DATA0: u32 = 0;
    /// PID DATA2
    pub const PID_DATA2: u32 = 1;
    /// PID DATA1
    pub const PID_DATA1: u32 = 2;
    /// PID SETUP (MDATA for OUT)
    pub const PID_SETUP: u32 = 3;

    /// Compose a transfer size word
    pub const fn encode(bytes: u32, packets: u32, pid: u32) -> u32 {
        (bytes & 0x7FFFF) | ((packets & 0x3FF) << 19) | ((pid & 0b11) << 29)
    }

    /// Byte count field
    pub const fn bytes(word: u32) -> u32 {
        word & 0x7FFFF
    }

    /// Packet count field
    pub const fn packets(word: u32) -> u32 {
        (word >> 19) & 0x3FF
    }

    /// PID field
    pub const fn pid(word: u32) -> u32 {
        (word >> 29) & 0b11
    }
}

/// Receive status word (GRXSTSR/GRXSTSP) decoding for host mode
pub mod grxsts {
    /// IN data packet received
    pub const PKTSTS_IN_DATA: u32 = 2;
    /// IN transfer completed
    pub const PKTSTS_IN_COMPLETE: u32 = 3;
    /// Data toggle error
    pub const PKTSTS_TOGGLE_ERROR: u32 = 5;
    /// Channel halted
    pub const PKTSTS_CHANNEL_HALTED: u32 = 7;

    /// Channel number field
    pub const fn channel(word: u32) -> usize {
        (word & 0xF) as usize
    }

    /// Byte count field
    pub const fn byte_count(word: u32) -> usize {
        ((word >> 4) & 0x7FF) as usize
    }

    /// Data PID field
    pub const fn dpid(word: u32) -> u32 {
        (word >> 15) & 0b11
    }

    /// Packet status field
    pub const fn packet_status(word: u32) -> u32 {
        (word >> 17) & 0xF
    }

    /// Compose a status word (used by tests and simulators)
    pub const fn encode(channel: usize, bytes: usize, dpid: u32, status: u32) -> u32 {
        (channel as u32 & 0xF) | ((bytes as u32 & 0x7FF) << 4) | ((dpid & 0b11) << 15) | ((status & 0xF) << 17)
    }
}

/// Current microframe (0..=7) from an HFNUM value
#[inline(always)]
pub const fn microframe(hfnum: u32) -> u8 {
    (hfnum & 7) as u8
}
