#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB 2.0 host-mode transfer engine for DesignWare OTG cores
//!
//! Drives the core in slave (non-DMA) mode: every packet moves through the
//! shared receive FIFO or a channel's transmit window under CPU control, and
//! software decides which transaction each host channel runs next.
//!
//! # Core Components
//!
//! - [`otg`] - register map, [`RegisterPort`] access and controller bring-up
//! - [`channel`] - host channel allocation and reuse after disable
//! - [`descriptor`] - packet-level transfer descriptors and their arena
//! - [`fifo`] - receive status latching and FIFO data movement
//! - [`protocol`] - per-packet state machine including split transactions
//! - [`transfer`] - pipes, requests, descriptor chains and completion
//! - [`dispatcher`] - interrupt and poll passes over channels and FIFO
//! - [`host`] - [`UsbHost`], the locked context tying it all together
//! - [`executor`] - blocking executor and transfer futures
//! - [`error`] - error and completion status types
//!
//! # Typical Flow
//!
//! 1. Bring the core up with [`OtgController`] and hand it to [`UsbHost`]
//! 2. Open a pipe per endpoint and submit [`TransferRequest`]s on it
//! 3. Call [`UsbHost::on_interrupt`] from the OTG interrupt, [`UsbHost::poll`]
//!    when it asks for deferred work, and [`UsbHost::timer_tick`] while the
//!    timer runs
//! 4. Drain [`Completion`]s and reclaim IN data

#[cfg(feature = "defmt")]
use defmt as _;

pub mod channel;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fifo;
pub mod host;
pub mod otg;
pub mod perf;
pub mod protocol;
pub mod timer;
pub mod transfer;

#[cfg(feature = "rtic-support")]
pub mod rtic;

pub use error::{Result, TransferStatus, UsbError};
pub use executor::{block_on, TransferFuture};
pub use host::UsbHost;
pub use otg::{HostConfig, HostConfigBuilder, MmioPort, OtgController, PortSpeed, PortStatus, RegisterPort};
pub use perf::{PerfCounters, PerfSnapshot};
pub use transfer::{
    Completion, Direction, EndpointConfig, HubRoute, PipeHandle, SetupPacket, TransferHandle, TransferRequest,
    TransferState, TransferType,
};
