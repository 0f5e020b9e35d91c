//! USB transfer requests, pipes and handles
//!
//! A pipe is an opened endpoint ([`EndpointConfig`]) that carries the
//! persistent data toggle. Each [`TransferRequest`] submitted on a pipe is
//! turned into a descriptor chain by [`chain`] and driven by the
//! [`lifecycle`] manager until it produces a [`Completion`].

pub mod chain;
pub mod lifecycle;

pub use lifecycle::{TransferDomain, MAX_PIPES, MAX_TRANSFERS, MAX_TRANSFER_SIZE};

use crate::error::{Result, TransferStatus, UsbError};
use crate::otg::PortSpeed;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// HCCHAR endpoint type encoding
    #[inline(always)]
    pub const fn hcchar_type(self) -> u32 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    /// Interrupt and isochronous endpoints are scheduled by the timer
    #[inline(always)]
    pub const fn is_periodic(self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    In,
    Out,
}

/// Transaction translator a full/low-speed device sits behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HubRoute {
    /// Address of the high-speed hub
    pub hub_address: u8,
    /// Downstream port number on that hub
    pub hub_port: u8,
}

/// Endpoint parameters a pipe is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    /// Device address on the bus
    pub device_address: u8,
    /// Endpoint number
    pub endpoint: u8,
    /// Data direction; ignored for control endpoints
    pub direction: Direction,
    /// Endpoint type
    pub transfer_type: TransferType,
    /// Max packet size from the endpoint descriptor
    pub max_packet_size: u16,
    /// Polling interval for periodic endpoints, in milliseconds
    pub interval_ms: u16,
    /// Device speed
    pub speed: PortSpeed,
    /// Set when the device hangs off a high-speed hub's transaction translator
    pub hub: Option<HubRoute>,
}

impl EndpointConfig {
    /// Default control endpoint of a device
    pub const fn control(device_address: u8, max_packet_size: u16, speed: PortSpeed) -> Self {
        Self {
            device_address,
            endpoint: 0,
            direction: Direction::Out,
            transfer_type: TransferType::Control,
            max_packet_size,
            interval_ms: 0,
            speed,
            hub: None,
        }
    }

    /// Bulk endpoint
    pub const fn bulk(device_address: u8, endpoint: u8, direction: Direction, max_packet_size: u16, speed: PortSpeed) -> Self {
        Self {
            device_address,
            endpoint,
            direction,
            transfer_type: TransferType::Bulk,
            max_packet_size,
            interval_ms: 0,
            speed,
            hub: None,
        }
    }

    /// Interrupt endpoint
    pub const fn interrupt(
        device_address: u8,
        endpoint: u8,
        direction: Direction,
        max_packet_size: u16,
        interval_ms: u16,
        speed: PortSpeed,
    ) -> Self {
        Self {
            device_address,
            endpoint,
            direction,
            transfer_type: TransferType::Interrupt,
            max_packet_size,
            interval_ms,
            speed,
            hub: None,
        }
    }

    /// Isochronous endpoint
    pub const fn isochronous(
        device_address: u8,
        endpoint: u8,
        direction: Direction,
        max_packet_size: u16,
        interval_ms: u16,
        speed: PortSpeed,
    ) -> Self {
        Self {
            device_address,
            endpoint,
            direction,
            transfer_type: TransferType::Isochronous,
            max_packet_size,
            interval_ms,
            speed,
            hub: None,
        }
    }

    /// Route the endpoint through a hub's transaction translator
    pub const fn via_hub(mut self, hub_address: u8, hub_port: u8) -> Self {
        self.hub = Some(HubRoute { hub_address, hub_port });
        self
    }

    /// Packets need split transactions
    #[inline(always)]
    pub const fn needs_split(&self) -> bool {
        self.hub.is_some() && !matches!(self.speed, PortSpeed::High)
    }

    /// Validate endpoint parameters
    pub fn validate(&self) -> Result<()> {
        if self.device_address > 127 || self.endpoint > 15 {
            return Err(UsbError::InvalidParameter);
        }
        if self.max_packet_size == 0 || self.max_packet_size as usize > crate::fifo::MAX_PACKET_SIZE {
            return Err(UsbError::InvalidParameter);
        }
        if self.transfer_type == TransferType::Control && self.endpoint != 0 {
            return Err(UsbError::Unsupported);
        }
        if self.transfer_type.is_periodic() && self.interval_ms == 0 {
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }
}

/// USB Setup packet for control transfers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Data stage length (wLength)
    pub length: u16,
}

impl SetupPacket {
    /// Create GET_DESCRIPTOR request
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: 0x06,
            value: ((desc_type as u16) << 8) | (desc_index as u16),
            index: language_id,
            length,
        }
    }

    /// Create SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00,
            request: 0x05,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// Create SET_CONFIGURATION request
    pub const fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: 0x00,
            request: 0x09,
            value: configuration as u16,
            index: 0,
            length: 0,
        }
    }

    /// Check if the data stage is device-to-host
    #[inline(always)]
    pub const fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Wire format, little-endian
    pub const fn to_bytes(&self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }
}

/// One transfer to submit on a pipe
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub(crate) setup: Option<SetupPacket>,
    pub(crate) out_data: &'a [u8],
    pub(crate) in_length: usize,
    pub(crate) timeout_ms: Option<u32>,
    pub(crate) short_ok: bool,
}

impl<'a> TransferRequest<'a> {
    /// Control transfer; `data` is the OUT data stage and is ignored for IN requests
    pub const fn control(setup: SetupPacket, data: &'a [u8]) -> Self {
        let in_length = if setup.is_in() { setup.length as usize } else { 0 };
        Self {
            setup: Some(setup),
            out_data: if setup.is_in() { &[] } else { data },
            in_length,
            timeout_ms: None,
            short_ok: true,
        }
    }

    /// OUT transfer on a bulk, interrupt or isochronous pipe
    pub const fn write(data: &'a [u8]) -> Self {
        Self {
            setup: None,
            out_data: data,
            in_length: 0,
            timeout_ms: None,
            short_ok: true,
        }
    }

    /// IN transfer of up to `length` bytes
    pub const fn read(length: usize) -> Self {
        Self {
            setup: None,
            out_data: &[],
            in_length: length,
            timeout_ms: None,
            short_ok: true,
        }
    }

    /// Override the configured deadline (0 disables it)
    pub const fn with_timeout_ms(mut self, ms: u32) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Treat a short IN packet as a failure
    pub const fn short_not_ok(mut self) -> Self {
        self.short_ok = false;
        self
    }

    /// Data stage direction, `None` when there is no data stage
    pub(crate) const fn data_direction(&self) -> Option<Direction> {
        if self.in_length != 0 {
            Some(Direction::In)
        } else if !self.out_data.is_empty() {
            Some(Direction::Out)
        } else {
            None
        }
    }

    /// Data stage length
    #[inline(always)]
    pub(crate) const fn data_len(&self) -> usize {
        if self.in_length != 0 {
            self.in_length
        } else {
            self.out_data.len()
        }
    }
}

/// Handle to an open pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle {
    pub(crate) index: u8,
    pub(crate) generation: u16,
}

impl PipeHandle {
    /// Slot index
    #[inline(always)]
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

/// Handle to a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferHandle {
    pub(crate) index: u8,
    pub(crate) generation: u16,
}

impl TransferHandle {
    /// Slot index
    #[inline(always)]
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

/// Progress of a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    /// Queued, not yet picked up by the dispatcher
    Pending,
    /// Descriptors are being executed
    Active,
    /// Completed with the given status, waiting to be reclaimed
    Done(TransferStatus),
}

/// Completion record delivered to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Transfer that finished
    pub transfer: TransferHandle,
    /// Pipe it was submitted on
    pub pipe: PipeHandle,
    pub status: TransferStatus,
    /// First error found while scanning the chain, if any
    pub error: Option<UsbError>,
    /// Sum of data bytes moved by the chain
    pub actual_length: usize,
    /// Packets re-issued after NAK or a transaction error
    pub retries: u32,
}
