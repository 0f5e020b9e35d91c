//! Shared test utilities for dwc-otg-usbh tests

#![allow(dead_code)]

pub mod mock_hardware;

pub use mock_hardware::{Issue, MockPort, NoDelay};

use dwc_otg_usbh::otg::HcInt;
use dwc_otg_usbh::{Completion, HostConfig, UsbHost};

/// Host on a scripted core with `channels` host channels
pub fn host(channels: usize) -> UsbHost<MockPort> {
    UsbHost::new(MockPort::new(channels), HostConfig::new(), channels)
}

/// Inject a handshake on the active channel and run a dispatcher pass
pub fn respond(host: &UsbHost<MockPort>, bits: HcInt) -> usize {
    let ch = host.with_port(|p| p.respond(bits));
    host.poll();
    ch
}

/// Deliver IN data on the active channel and run a dispatcher pass
pub fn respond_data(host: &UsbHost<MockPort>, data: &[u8]) -> usize {
    let ch = host.with_port(|p| p.respond_data(data));
    host.poll();
    ch
}

/// Collect queued completions
pub fn completions(host: &UsbHost<MockPort>) -> Vec<Completion> {
    let mut out = Vec::new();
    host.drain_completions(|c| out.push(c));
    out
}

/// Last channel enable seen by the core
pub fn last_issue(host: &UsbHost<MockPort>) -> Issue {
    host.with_port(|p| p.last_issue())
}

/// Number of channel enables seen by the core
pub fn issue_count(host: &UsbHost<MockPort>) -> usize {
    host.with_port(|p| p.issues.len())
}

/// Nothing claimed, nothing allocated
pub fn assert_no_leaks(host: &UsbHost<MockPort>) {
    assert_eq!(host.channels_in_use(), 0, "channels still claimed");
    let stats = host.pool_stats();
    assert_eq!(stats.available, stats.total, "descriptors still allocated");
}
