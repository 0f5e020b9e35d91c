//! Resource management: channels, transfer slots, descriptors, pipes
//! and the polling executor

mod common;

use core::pin::pin;

use common::{completions, issue_count, last_issue, respond, respond_data};
use dwc_otg_usbh::executor::poll_once;
use dwc_otg_usbh::otg::{hctsiz, HcInt};
use dwc_otg_usbh::transfer::{MAX_TRANSFERS, MAX_TRANSFER_SIZE};
use dwc_otg_usbh::{
    Direction, EndpointConfig, PortSpeed, SetupPacket, TransferRequest, TransferState, TransferStatus, UsbError,
};

#[test]
fn test_channel_handed_to_waiting_transfer() {
    let host = common::host(2);
    let a = host.open(EndpointConfig::bulk(2, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    let b = host.open(EndpointConfig::bulk(2, 2, Direction::Out, 64, PortSpeed::High)).unwrap();
    host.submit(a, &TransferRequest::write(&[1; 4])).unwrap();
    host.submit(b, &TransferRequest::write(&[2; 4])).unwrap();

    assert_eq!(issue_count(&host), 1, "only one non-control channel");
    assert!(host.perf().snapshot().channel_exhaustion >= 1);

    respond(&host, HcInt::ACK);
    assert_eq!(issue_count(&host), 2);
    assert_eq!(last_issue(&host).channel, 1);
    assert_eq!(host.with_port(|p| p.sent(1, 4)), [2; 4]);
    respond(&host, HcInt::ACK);

    let done = completions(&host);
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|c| c.status == TransferStatus::Success));
    common::assert_no_leaks(&host);
}

#[test]
fn test_control_confined_to_channel_zero() {
    let host = common::host(4);
    let ctrl = host.open(EndpointConfig::control(1, 64, PortSpeed::High)).unwrap();
    let bulk = host.open(EndpointConfig::bulk(1, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    host.submit(bulk, &TransferRequest::write(&[0; 4])).unwrap();
    host.submit(ctrl, &TransferRequest::control(SetupPacket::set_configuration(1), &[])).unwrap();

    let channels = host.with_port(|p| p.enabled_channels());
    assert_eq!(channels, vec![0, 1]);
}

#[test]
fn test_transfer_slots_exhaust() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    for _ in 0..MAX_TRANSFERS {
        host.submit(pipe, &TransferRequest::write(&[0; 4])).unwrap();
    }
    assert_eq!(host.submit(pipe, &TransferRequest::write(&[0; 4])), Err(UsbError::NoResources));
}

#[test]
fn test_request_validation() {
    let host = common::host(4);
    let out = host.open(EndpointConfig::bulk(2, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    let big = vec![0u8; MAX_TRANSFER_SIZE + 1];
    assert_eq!(host.submit(out, &TransferRequest::write(&big)), Err(UsbError::BufferOverflow));
    assert_eq!(host.submit(out, &TransferRequest::read(8)), Err(UsbError::InvalidParameter));

    assert_eq!(
        host.open(EndpointConfig::bulk(2, 1, Direction::Out, 0, PortSpeed::High)),
        Err(UsbError::InvalidParameter)
    );
    assert_eq!(issue_count(&host), 0);
}

#[test]
fn test_reclaim_lifecycle() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::In, 64, PortSpeed::High)).unwrap();
    let xfer = host.submit(pipe, &TransferRequest::read(64)).unwrap();

    let mut small = [0u8; 4];
    assert_eq!(host.reclaim(xfer, &mut small), Err(UsbError::InvalidState));
    assert_eq!(host.status(xfer), Ok(TransferState::Active));

    respond_data(&host, &[8; 16]);
    assert_eq!(host.reclaim(xfer, &mut small), Err(UsbError::BufferOverflow));
    let mut buf = [0u8; 64];
    assert_eq!(host.reclaim(xfer, &mut buf), Ok(16));
    assert_eq!(host.status(xfer), Err(UsbError::InvalidHandle));
    assert_eq!(host.reclaim(xfer, &mut buf), Err(UsbError::InvalidHandle));
}

#[test]
fn test_close_cancels_outstanding() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::In, 64, PortSpeed::High)).unwrap();
    let first = host.submit(pipe, &TransferRequest::read(64)).unwrap();
    let second = host.submit(pipe, &TransferRequest::read(64)).unwrap();
    host.close(pipe).unwrap();

    let done = completions(&host);
    assert_eq!(done.len(), 2);
    assert!(done.iter().all(|c| c.status == TransferStatus::Cancelled));
    assert!(done.iter().any(|c| c.transfer == first));
    assert!(done.iter().any(|c| c.transfer == second));
    assert_eq!(host.pipe_toggle(pipe), Err(UsbError::InvalidHandle));
    assert_eq!(host.submit(pipe, &TransferRequest::read(8)), Err(UsbError::InvalidHandle));
    common::assert_no_leaks(&host);
}

#[test]
fn test_no_leaks_after_many_transfers() {
    let host = common::host(4);
    let ctrl = host.open(EndpointConfig::control(0, 8, PortSpeed::Full)).unwrap();
    let mut reported = 0;
    for _ in 0..40 {
        let setup = SetupPacket::get_descriptor(1, 0, 0, 18);
        let xfer = host.submit(ctrl, &TransferRequest::control(setup, &[])).unwrap();
        respond(&host, HcInt::ACK);
        for chunk in [&[1u8; 8][..], &[2; 8], &[3; 2]] {
            respond_data(&host, chunk);
        }
        respond(&host, HcInt::ACK);

        let mut buf = [0u8; 18];
        assert_eq!(host.reclaim(xfer, &mut buf), Ok(18));
        assert_eq!(buf[16..], [3, 3]);
        reported += completions(&host).len();
    }
    assert_eq!(reported, 40);
    assert_eq!(host.perf().snapshot().transfers_success, 40);
    common::assert_no_leaks(&host);
}

#[test]
fn test_suspend_holds_retries() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    host.submit(pipe, &TransferRequest::write(&[1; 4])).unwrap();
    host.suspend();
    respond(&host, HcInt::NAK);
    assert_eq!(issue_count(&host), 1);

    host.resume();
    assert_eq!(issue_count(&host), 2);
    assert_eq!(last_issue(&host).pid(), hctsiz::PID_DATA0);
}

#[test]
fn test_future_resolves_with_in_data() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::In, 64, PortSpeed::High)).unwrap();
    let mut buf = [0u8; 64];
    {
        let mut fut = pin!(host.transfer(pipe, &TransferRequest::read(64), &mut buf).unwrap());
        assert!(poll_once(fut.as_mut()).is_pending());
        host.with_port(|p| p.respond_data(&[0x55; 33]));
        match poll_once(fut.as_mut()) {
            core::task::Poll::Ready(result) => assert_eq!(result, Ok(33)),
            core::task::Poll::Pending => panic!("transfer did not resolve"),
        }
    }
    assert_eq!(&buf[..33], &[0x55; 33]);
    common::assert_no_leaks(&host);
}

#[test]
fn test_future_reports_error() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::Out, 64, PortSpeed::High)).unwrap();
    let mut empty = [0u8; 0];
    let mut fut = pin!(host.transfer(pipe, &TransferRequest::write(&[1; 4]), &mut empty).unwrap());
    host.with_port(|p| p.respond(HcInt::STALL));
    assert_eq!(poll_once(fut.as_mut()), core::task::Poll::Ready(Err(UsbError::Stalled)));
}

#[test]
fn test_future_with_short_buffer_frees_slot() {
    let host = common::host(4);
    let pipe = host.open(EndpointConfig::bulk(2, 1, Direction::In, 64, PortSpeed::High)).unwrap();
    let mut small = [0u8; 4];
    {
        let mut fut = pin!(host.transfer(pipe, &TransferRequest::read(64), &mut small).unwrap());
        assert!(poll_once(fut.as_mut()).is_pending());
        host.with_port(|p| p.respond_data(&[0x11; 64]));
        assert_eq!(poll_once(fut.as_mut()), core::task::Poll::Ready(Err(UsbError::BufferOverflow)));
    }
    common::assert_no_leaks(&host);

    // Every slot is still available
    completions(&host);
    let out = host.open(EndpointConfig::bulk(2, 2, Direction::Out, 64, PortSpeed::High)).unwrap();
    for _ in 0..MAX_TRANSFERS {
        host.submit(out, &TransferRequest::write(&[0; 4])).unwrap();
    }
}
