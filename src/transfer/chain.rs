//! Descriptor chain construction
//!
//! A control transfer becomes SETUP, one descriptor per data packet, then
//! STATUS. Other transfers are one descriptor per packet, with a single
//! zero-length descriptor for an empty request.

use crate::descriptor::{Chain, Descriptor, DescriptorPool, TdFlags, TdKind, MAX_CHAIN_LEN};
use crate::error::{Result, UsbError};
use crate::otg::{HcChar, HcSplt, PortSpeed};
use crate::transfer::{Direction, EndpointConfig, TransferRequest, TransferType};

/// Per-pipe state seeded into a new chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSeed {
    /// Data toggle for the first data packet (non-control pipes)
    pub toggle: bool,
    /// Pacing value at which the first periodic packet may go out
    pub tmr_val: u8,
    /// Periodic interval in timer ticks
    pub tmr_res: u8,
}

/// Number of descriptors `req` needs on `config`
pub fn descriptor_count(config: &EndpointConfig, req: &TransferRequest<'_>) -> usize {
    let mps = config.max_packet_size.max(1) as usize;
    let len = req.data_len();
    let data = if len == 0 {
        usize::from(config.transfer_type != TransferType::Control)
    } else {
        len.div_ceil(mps)
    };
    if config.transfer_type == TransferType::Control {
        data + 2
    } else {
        data
    }
}

/// Timer ticks between periodic packets, clamped to the pacing window
pub fn pacing_interval(config: &EndpointConfig, timer_period_ms: u32) -> u8 {
    if !config.transfer_type.is_periodic() {
        return 1;
    }
    let period = timer_period_ms.max(1);
    (u32::from(config.interval_ms) / period).clamp(1, 127) as u8
}

/// Allocate and fill the descriptor chain for `req`
///
/// Allocation is all or nothing: on failure the pool is unchanged.
pub fn build_chain<const N: usize>(
    pool: &mut DescriptorPool<N>,
    config: &EndpointConfig,
    req: &TransferRequest<'_>,
    seed: ChainSeed,
) -> Result<Chain> {
    let count = descriptor_count(config, req);
    if count > MAX_CHAIN_LEN {
        return Err(UsbError::InvalidParameter);
    }
    let chain = pool.alloc_chain(count)?;

    let control = config.transfer_type == TransferType::Control;
    let mps = config.max_packet_size as usize;
    let len = req.data_len();
    let data_dir = if control { req.data_direction() } else { Some(config.direction) };
    let template = template(config, seed);

    let mut slot = 0;
    let mut fill = |pool: &mut DescriptorPool<N>, td: Descriptor| {
        if let Some(d) = chain.get(slot).and_then(|h| pool.get_mut(*h)) {
            *d = td;
        }
        slot += 1;
    };

    if control {
        let mut td = template;
        td.kind = TdKind::SetupTx;
        td.remainder = 8;
        fill(pool, td);
    }

    let packets = count - if control { 2 } else { 0 };
    for p in 0..packets {
        let mut td = template;
        td.kind = match data_dir {
            Some(Direction::In) => TdKind::DataRx,
            _ => TdKind::DataTx,
        };
        td.offset = p * mps;
        td.remainder = mps.min(len.saturating_sub(td.offset));
        if td.remainder < mps {
            td.flags |= TdFlags::SHORT_FINAL;
        }
        if control {
            td.flags |= TdFlags::ALT_NEXT;
            td.toggle = true;
        }
        fill(pool, td);
    }

    if control {
        let mut td = template;
        // Opposite of the data stage. Without a data stage the device
        // acknowledges with a zero-length IN packet.
        td.kind = match data_dir {
            Some(Direction::In) => TdKind::DataTx,
            _ => TdKind::DataRx,
        };
        td.toggle = true;
        td.flags |= TdFlags::SET_TOGGLE | TdFlags::STATUS_STAGE;
        fill(pool, td);
    }

    if let Some(last) = chain.last().and_then(|h| pool.get_mut(*h)) {
        last.flags |= TdFlags::LAST;
    }

    #[cfg(feature = "defmt")]
    defmt::trace!("chain: {} descriptors for ep{} len={}", count, config.endpoint, len);
    Ok(chain)
}

/// Descriptor fields shared by every packet of the endpoint
fn template(config: &EndpointConfig, seed: ChainSeed) -> Descriptor {
    let low_speed = matches!(config.speed, PortSpeed::Low);
    let hcchar = HcChar::endpoint(
        config.max_packet_size,
        config.endpoint,
        config.device_address,
        config.transfer_type.hcchar_type(),
        low_speed,
    );
    let mut td = Descriptor::new(TdKind::DataTx, config.transfer_type, hcchar, config.max_packet_size);

    if let (true, Some(route)) = (config.needs_split(), config.hub) {
        td.hcsplt = HcSplt::hub(route.hub_address, route.hub_port);
        if config.transfer_type == TransferType::Isochronous {
            td.hcsplt |= HcSplt::XACTPOS_ALL;
        }
    }
    td.toggle = seed.toggle;
    td.tmr_val = seed.tmr_val;
    td.tmr_res = seed.tmr_res;
    td
}
