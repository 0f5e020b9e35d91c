//! OTG core bring-up and host port control
//!
//! Lifecycle is tracked in the type: [`OtgController<P, Uninitialized>`] is
//! reset and sized into `Initialized`, then powered into `Running`, at which
//! point the port and configuration are handed to the transfer engine.

use core::marker::PhantomData;

use embedded_hal::delay::DelayNs;

use super::{
    GahbCfg, GintSts, GrstCtl, GusbCfg, HCfg, HcInt, Hprt, RegisterPort, RegisterTimeout, GAHBCFG,
    GHWCFG2, GHWCFG3, GINTMSK, GINTSTS, GNPTXFSIZ, GRSTCTL, GRXFSIZ, GSNPSID, GUSBCFG, HAINTMSK, HCFG,
    HFIR, HPRT, HPTXFSIZ, MAX_HOST_CHANNELS, PCGCCTL, SNPSID_SIGNATURE,
};
use crate::error::{Result, UsbError};

/// Controller lifecycle states for compile-time state tracking
pub struct Uninitialized;
/// Core reset, FIFOs sized, channel masks programmed
pub struct Initialized;
/// Port powered, interrupts routed
pub struct Running;

/// Host engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostConfig {
    /// Timer tick period in milliseconds
    pub timer_period_ms: u32,
    /// Deadline applied to transfers that do not set one (0 = none)
    pub default_timeout_ms: u32,
    /// Consecutive transaction errors tolerated per descriptor
    pub max_error_count: u8,
    /// RX FIFO depth in 32-bit words
    pub rx_fifo_words: u16,
    /// Non-periodic TX FIFO depth in 32-bit words
    pub nptx_fifo_words: u16,
    /// Periodic TX FIFO depth in 32-bit words
    pub ptx_fifo_words: u16,
    /// Route core interrupts to the CPU; `false` runs the engine by polling
    pub use_interrupts: bool,
    /// Polls allowed for each self-clearing reset/flush bit
    pub reset_poll_budget: u32,
}

impl HostConfig {
    /// Default configuration (const-compatible)
    pub const fn new() -> Self {
        Self {
            timer_period_ms: 10,
            default_timeout_ms: 5000,
            max_error_count: 3,
            rx_fifo_words: 256,
            nptx_fifo_words: 128,
            ptx_fifo_words: 128,
            use_interrupts: true,
            reset_poll_budget: 1000,
        }
    }

    /// Convert a millisecond duration into timer ticks, rounding up
    pub const fn ms_to_ticks(&self, ms: u32) -> u32 {
        let period = if self.timer_period_ms == 0 { 1 } else { self.timer_period_ms };
        (ms + period - 1) / period
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder pattern for host configuration
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Create new builder with default values
    pub const fn new() -> Self {
        Self { config: HostConfig::new() }
    }

    /// Set timer tick period
    pub const fn timer_period_ms(mut self, ms: u32) -> Self {
        self.config.timer_period_ms = ms;
        self
    }

    /// Set default transfer deadline (0 disables)
    pub const fn default_timeout_ms(mut self, ms: u32) -> Self {
        self.config.default_timeout_ms = ms;
        self
    }

    /// Set the per-descriptor transaction error budget
    pub const fn max_error_count(mut self, count: u8) -> Self {
        self.config.max_error_count = count;
        self
    }

    /// Set FIFO partition sizes in words
    pub const fn fifo_words(mut self, rx: u16, nptx: u16, ptx: u16) -> Self {
        self.config.rx_fifo_words = rx;
        self.config.nptx_fifo_words = nptx;
        self.config.ptx_fifo_words = ptx;
        self
    }

    /// Enable/disable interrupt delivery
    pub const fn use_interrupts(mut self, enabled: bool) -> Self {
        self.config.use_interrupts = enabled;
        self
    }

    /// Set the poll budget for reset and flush waits
    pub const fn reset_poll_budget(mut self, polls: u32) -> Self {
        self.config.reset_poll_budget = polls;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<HostConfig> {
        let c = self.config;
        if c.timer_period_ms == 0 || c.max_error_count == 0 || c.rx_fifo_words < 16 {
            return Err(UsbError::InvalidParameter);
        }
        Ok(c)
    }
}

impl Default for HostConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus speed of the attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSpeed {
    /// 480 Mbit/s
    High,
    /// 12 Mbit/s
    Full,
    /// 1.5 Mbit/s
    Low,
}

impl PortSpeed {
    /// Decode the HPRT speed field
    pub fn from_hprt(hprt: Hprt) -> Self {
        match hprt.speed_bits() {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Full,
        }
    }
}

/// Decoded root port status, consumed by root-hub emulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortStatus {
    /// Device attached
    pub connected: bool,
    /// Port enabled after reset
    pub enabled: bool,
    /// Over-current condition present
    pub over_current: bool,
    /// Port power on
    pub powered: bool,
    /// Port suspended
    pub suspended: bool,
    /// Port is in reset
    pub resetting: bool,
    /// Speed of the attached device
    pub speed: PortSpeed,
    /// Connect status changed since last acknowledge
    pub connect_changed: bool,
    /// Enable status changed since last acknowledge
    pub enable_changed: bool,
    /// Over-current status changed since last acknowledge
    pub over_current_changed: bool,
}

impl PortStatus {
    /// Decode an HPRT value
    pub fn from_hprt(hprt: Hprt) -> Self {
        Self {
            connected: hprt.contains(Hprt::PRTCONNSTS),
            enabled: hprt.contains(Hprt::PRTENA),
            over_current: hprt.contains(Hprt::PRTOVRCURRACT),
            powered: hprt.contains(Hprt::PRTPWR),
            suspended: hprt.contains(Hprt::PRTSUSP),
            resetting: hprt.contains(Hprt::PRTRST),
            speed: PortSpeed::from_hprt(hprt),
            connect_changed: hprt.contains(Hprt::PRTCONNDET),
            enable_changed: hprt.contains(Hprt::PRTENCHNG),
            over_current_changed: hprt.contains(Hprt::PRTOVRCURRCHNG),
        }
    }

    /// Check if any change flag is set
    pub const fn has_change(&self) -> bool {
        self.connect_changed || self.enable_changed || self.over_current_changed
    }
}

/// Read HPRT without disturbing its write-1-to-clear bits
pub fn read_port_status<P: RegisterPort>(port: &mut P) -> PortStatus {
    PortStatus::from_hprt(Hprt::from_bits_retain(port.read(HPRT)))
}

/// Write HPRT control bits, never acknowledging change flags by accident
pub fn write_port_control<P: RegisterPort>(port: &mut P, f: impl FnOnce(Hprt) -> Hprt) {
    let current = Hprt::from_bits_retain(port.read(HPRT)).difference(Hprt::W1C_MASK);
    port.write(HPRT, f(current).bits());
}

/// Acknowledge the port change flags, returning the status seen before the acknowledge
pub fn acknowledge_port_change<P: RegisterPort>(port: &mut P) -> PortStatus {
    let raw = Hprt::from_bits_retain(port.read(HPRT));
    let change = raw & (Hprt::PRTCONNDET | Hprt::PRTENCHNG | Hprt::PRTOVRCURRCHNG);
    port.write(HPRT, (raw.difference(Hprt::W1C_MASK) | change).bits());
    PortStatus::from_hprt(raw)
}

/// Program HCFG clock select and HFIR for the speed on the root port
pub fn update_frame_interval<P: RegisterPort>(port: &mut P, speed: PortSpeed) {
    let (clk, interval) = match speed {
        PortSpeed::High => (HCfg::FSLSPCLKSEL_30_60, 7500),
        PortSpeed::Full => (HCfg::FSLSPCLKSEL_48, 48000),
        PortSpeed::Low => (HCfg::FSLSPCLKSEL_6, 6000),
    };
    port.modify(HCFG, |v| (v & !HCfg::FSLSPCLKSEL_MASK.bits()) | clk.bits());
    port.modify(HFIR, |v| (v & !0xFFFF) | interval);
}

/// DWC OTG core with compile-time lifecycle tracking
pub struct OtgController<P: RegisterPort, State = Uninitialized> {
    port: P,
    config: HostConfig,
    channel_count: usize,
    fifo_depth_words: u32,
    _state: PhantomData<State>,
}

impl<P: RegisterPort> OtgController<P, Uninitialized> {
    /// Wrap a register port, validating the core id
    pub fn new(mut port: P, config: HostConfig) -> Result<Self> {
        let snpsid = port.read(GSNPSID);
        if snpsid >> 16 != SNPSID_SIGNATURE {
            #[cfg(feature = "defmt")]
            defmt::error!("not a DWC OTG core: GSNPSID={=u32:#x}", snpsid);
            return Err(UsbError::UnsupportedCore);
        }

        let hwcfg2 = port.read(GHWCFG2);
        let hwcfg3 = port.read(GHWCFG3);
        let channel_count = ((((hwcfg2 >> 14) & 0xF) + 1) as usize).min(MAX_HOST_CHANNELS);

        Ok(Self {
            port,
            config,
            channel_count,
            fifo_depth_words: hwcfg3 >> 16,
            _state: PhantomData,
        })
    }

    /// Reset the core, force host mode and partition the FIFOs
    ///
    /// A core that never reports AHB idle or never clears its soft-reset bit
    /// within `reset_poll_budget` polls fails with [`UsbError::ResetTimeout`].
    pub fn initialize<D: DelayNs>(mut self, delay: &mut D) -> Result<OtgController<P, Initialized>> {
        let wait = RegisterTimeout::new(self.config.reset_poll_budget, 10);

        wait.wait_for(&mut self.port, delay, GRSTCTL, |v| v & GrstCtl::AHBIDLE.bits() != 0)
            .inspect_err(|_| {
                #[cfg(feature = "defmt")]
                defmt::error!("AHB master never went idle");
            })?;
        self.port.write(GRSTCTL, GrstCtl::CSFTRST.bits());
        wait.wait_for(&mut self.port, delay, GRSTCTL, |v| v & GrstCtl::CSFTRST.bits() == 0)
            .inspect_err(|_| {
                #[cfg(feature = "defmt")]
                defmt::error!("core soft reset did not complete");
            })?;

        // Mode switch takes up to 25 ms to settle
        self.port.modify(GUSBCFG, |v| {
            (v & !GusbCfg::FORCEDEVMODE.bits()) | GusbCfg::FORCEHOSTMODE.bits()
        });
        delay.delay_ms(25);
        self.port.write(PCGCCTL, 0);

        self.init_fifo(delay, &wait)?;

        Ok(OtgController {
            port: self.port,
            config: self.config,
            channel_count: self.channel_count,
            fifo_depth_words: self.fifo_depth_words,
            _state: PhantomData,
        })
    }

    fn init_fifo<D: DelayNs>(&mut self, delay: &mut D, wait: &RegisterTimeout) -> Result<()> {
        let rx = self.config.rx_fifo_words as u32;
        let nptx = self.config.nptx_fifo_words as u32;
        let ptx = self.config.ptx_fifo_words as u32;
        if self.fifo_depth_words != 0 && rx + nptx + ptx > self.fifo_depth_words {
            return Err(UsbError::InvalidParameter);
        }

        self.port.write(GRXFSIZ, rx);
        self.port.write(GNPTXFSIZ, (nptx << 16) | rx);
        self.port.write(HPTXFSIZ, (ptx << 16) | (rx + nptx));

        self.port.write(GRSTCTL, (GrstCtl::TXFFLSH | GrstCtl::TXFNUM_ALL).bits());
        wait.wait_for(&mut self.port, delay, GRSTCTL, |v| v & GrstCtl::TXFFLSH.bits() == 0)?;
        self.port.write(GRSTCTL, GrstCtl::RXFFLSH.bits());
        wait.wait_for(&mut self.port, delay, GRSTCTL, |v| v & GrstCtl::RXFFLSH.bits() == 0)?;

        let mut all = 0;
        for ch in 0..self.channel_count {
            self.port.write(super::hcintmsk(ch), HcInt::DEFAULT_MASK.bits());
            self.port.write(super::hcint(ch), 0xFFFF_FFFF);
            all |= 1 << ch;
        }
        self.port.write(HAINTMSK, all);
        Ok(())
    }
}

impl<P: RegisterPort> OtgController<P, Initialized> {
    /// Power the port and route interrupts
    pub fn start<D: DelayNs>(mut self, delay: &mut D) -> OtgController<P, Running> {
        write_port_control(&mut self.port, |h| h | Hprt::PRTPWR);
        delay.delay_ms(20);

        self.port.write(GINTSTS, 0xFFFF_FFFF);
        self.port.write(GINTMSK, (GintSts::RXFLVL | GintSts::HCHINT | GintSts::PRTINT).bits());
        if self.config.use_interrupts {
            self.port.set_bits(GAHBCFG, GahbCfg::GLBLINTRMSK.bits());
        } else {
            self.port.clear_bits(GAHBCFG, GahbCfg::GLBLINTRMSK.bits());
        }

        OtgController {
            port: self.port,
            config: self.config,
            channel_count: self.channel_count,
            fifo_depth_words: self.fifo_depth_words,
            _state: PhantomData,
        }
    }
}

impl<P: RegisterPort> OtgController<P, Running> {
    /// Drive USB reset on the root port and reprogram the frame interval
    pub fn port_reset<D: DelayNs>(&mut self, delay: &mut D) -> PortStatus {
        write_port_control(&mut self.port, |h| h | Hprt::PRTRST);
        delay.delay_ms(50);
        write_port_control(&mut self.port, |h| h.difference(Hprt::PRTRST));
        delay.delay_ms(10);

        let status = read_port_status(&mut self.port);
        update_frame_interval(&mut self.port, status.speed);
        status
    }

    /// Hand the port and configuration to the transfer engine
    pub fn into_parts(self) -> (P, HostConfig, usize) {
        (self.port, self.config, self.channel_count)
    }
}

impl<P: RegisterPort, State> OtgController<P, State> {
    /// Host channels reported by the hardware
    #[inline(always)]
    pub const fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Total FIFO RAM in words
    #[inline(always)]
    pub const fn fifo_depth_words(&self) -> u32 {
        self.fifo_depth_words
    }

    /// Current root port status
    pub fn port_status(&mut self) -> PortStatus {
        read_port_status(&mut self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BringUpPort {
        regs: [u32; 0x480 / 4],
        csftrst_sticks: bool,
    }

    impl BringUpPort {
        fn new() -> Self {
            let mut regs = [0; 0x480 / 4];
            regs[GSNPSID / 4] = 0x4F54_280A;
            regs[GHWCFG2 / 4] = 7 << 14;
            regs[GHWCFG3 / 4] = 1024 << 16;
            regs[GRSTCTL / 4] = GrstCtl::AHBIDLE.bits();
            Self { regs, csftrst_sticks: false }
        }
    }

    impl RegisterPort for BringUpPort {
        fn read(&mut self, offset: usize) -> u32 {
            self.regs.get(offset / 4).copied().unwrap_or(0)
        }

        fn write(&mut self, offset: usize, value: u32) {
            let value = if offset == GRSTCTL {
                let mut v = value | GrstCtl::AHBIDLE.bits();
                if !self.csftrst_sticks {
                    v &= !(GrstCtl::CSFTRST | GrstCtl::RXFFLSH | GrstCtl::TXFFLSH).bits();
                }
                v
            } else {
                value
            };
            if let Some(r) = self.regs.get_mut(offset / 4) {
                *r = value;
            }
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn test_bring_up_reads_channel_count() {
        let ctrl = OtgController::new(BringUpPort::new(), HostConfig::new()).unwrap();
        assert_eq!(ctrl.channel_count(), 8);
        let ctrl = ctrl.initialize(&mut NoDelay).unwrap();
        let mut ctrl = ctrl.start(&mut NoDelay);
        assert!(ctrl.port_status().powered);
        let (mut port, _, channels) = ctrl.into_parts();
        assert_eq!(channels, 8);
        assert_eq!(port.read(HAINTMSK), 0xFF);
        assert_eq!(port.read(GRXFSIZ), 256);
        assert!(port.read(GUSBCFG) & GusbCfg::FORCEHOSTMODE.bits() != 0);
    }

    #[test]
    fn test_reset_failure_is_reported() {
        let mut port = BringUpPort::new();
        port.csftrst_sticks = true;
        let config = HostConfigBuilder::new().reset_poll_budget(4).build().unwrap();
        let ctrl = OtgController::new(port, config).unwrap();
        assert!(matches!(ctrl.initialize(&mut NoDelay), Err(UsbError::ResetTimeout)));
    }

    #[test]
    fn test_wrong_core_rejected() {
        let mut port = BringUpPort::new();
        port.regs[GSNPSID / 4] = 0x1234_0000;
        assert!(matches!(OtgController::new(port, HostConfig::new()), Err(UsbError::UnsupportedCore)));
    }

    #[test]
    fn test_port_write_masks_change_bits() {
        let mut port = BringUpPort::new();
        port.regs[HPRT / 4] = (Hprt::PRTCONNSTS | Hprt::PRTCONNDET | Hprt::PRTENA).bits();
        write_port_control(&mut port, |h| h | Hprt::PRTPWR);
        let written = Hprt::from_bits_retain(port.regs[HPRT / 4]);
        assert!(written.contains(Hprt::PRTPWR));
        assert!(!written.contains(Hprt::PRTCONNDET));
        assert!(!written.contains(Hprt::PRTENA));
    }

    #[test]
    fn test_frame_interval_per_speed() {
        let mut port = BringUpPort::new();
        update_frame_interval(&mut port, PortSpeed::Full);
        assert_eq!(port.regs[HFIR / 4] & 0xFFFF, 48000);
        assert_eq!(port.regs[HCFG / 4] & 0b11, HCfg::FSLSPCLKSEL_48.bits());
        update_frame_interval(&mut port, PortSpeed::High);
        assert_eq!(port.regs[HFIR / 4] & 0xFFFF, 7500);
    }

    #[test]
    fn test_builder_rejects_zero_period() {
        assert!(HostConfigBuilder::new().timer_period_ms(0).build().is_err());
        assert_eq!(HostConfig::new().ms_to_ticks(25), 3);
    }
}
