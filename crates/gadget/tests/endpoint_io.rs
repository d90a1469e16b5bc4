//! Integration tests for endpoint file I/O
//!
//! Covers:
//! - reads waiting for the endpoints to be enabled
//! - direction mismatch halts, overflow on aligned reads
//! - endpoint disable while a read is outstanding
//! - asynchronous submission, completion and cancellation

mod harness;

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, FixtureEndpoint, FunctionFixture, create_test_payload, with_timeout,
};
use gadget::{AioOutcome, FfsError, LoopbackOptions};
use harness::Rig;
use protocol::UsbSpeed;
use std::thread;
use std::time::Duration;

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;
const HOST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Synchronous transfers
// ============================================================================

#[test]
fn test_read_waits_for_enable() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let mut buf = [0u8; 64];
    let (n, function) = thread::scope(|scope| {
        let host = scope.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            let function = rig.enabled(&session);
            rig.controller.host_write(EP_OUT, b"ping", HOST_TIMEOUT).unwrap();
            function
        });
        let n = reader.read(&mut buf).unwrap();
        (n, host.join().unwrap())
    });
    assert_eq!(&buf[..n], b"ping");
    assert!(function.is_bound());
}

#[test]
fn test_write_needs_enabled_endpoint() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let mut writer = session.open_endpoint("ep1", harness::waiter()).unwrap();
    assert_eq!(writer.write(b"early"), Err(FfsError::DeviceGone));

    writer.set_nonblocking(true);
    assert_eq!(writer.write(b"early"), Err(FfsError::WouldBlock));
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();
    reader.set_nonblocking(true);
    assert_eq!(reader.read(&mut [0u8; 8]), Err(FfsError::WouldBlock));
}

#[test]
fn test_bulk_write_reaches_host() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let mut writer = session.open_endpoint("ep1", harness::waiter()).unwrap();

    let payload = create_test_payload(700);
    let controller = rig.controller.clone();
    let host = thread::spawn(move || controller.host_read(EP_IN, 1024, HOST_TIMEOUT));
    assert_eq!(writer.write(&payload), Ok(700));
    assert_eq!(host.join().unwrap(), Ok(payload));
}

#[test]
fn test_blocked_write_is_interrupted() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let mut writer = session.open_endpoint("ep1", harness::waiter()).unwrap();

    let interrupt = writer.interrupt();
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        interrupt.raise();
    });
    assert_eq!(writer.write(b"nobody listens"), Err(FfsError::Interrupted));
    raiser.join().unwrap();
    assert_eq!(rig.controller.pending(EP_IN), 0);
}

#[test]
fn test_direction_mismatch_halts() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);

    let mut ep_in = session.open_endpoint("ep1", harness::waiter()).unwrap();
    assert_eq!(ep_in.read(&mut [0u8; 8]), Err(FfsError::Halted));
    let hw = rig.controller.endpoint(EP_IN).unwrap();
    assert!(hw.is_halted());
    ep_in.clear_halt().unwrap();
    assert!(!hw.is_halted());

    let mut ep_out = session.open_endpoint("ep2", harness::waiter()).unwrap();
    assert_eq!(ep_out.write(b"wrong way"), Err(FfsError::Halted));
    assert!(rig.controller.endpoint(EP_OUT).unwrap().is_halted());
}

#[test]
fn test_isochronous_endpoint_cannot_halt() {
    let rig = Rig::new();
    let fixture = FunctionFixture::bulk_loopback()
        .with_endpoints(vec![FixtureEndpoint::isochronous(0x81), FixtureEndpoint::bulk(0x02)]);
    let (_control, session) = rig.active("usb0", &fixture);
    let _function = rig.enabled(&session);

    let mut ep_in = session.open_endpoint("ep1", harness::waiter()).unwrap();
    assert!(matches!(
        ep_in.read(&mut [0u8; 8]),
        Err(FfsError::InvalidArgument(_))
    ));
    assert!(!rig.controller.endpoint(EP_IN).unwrap().is_halted());
}

#[test]
fn test_aligned_read_overflows_small_buffer() {
    let rig = Rig::with_options(LoopbackOptions {
        align_out: true,
        ..LoopbackOptions::default()
    });
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let controller = rig.controller.clone();
    let host = thread::spawn(move || {
        controller.host_write(EP_OUT, &create_test_payload(100), HOST_TIMEOUT)
    });
    assert_eq!(
        reader.read(&mut [0u8; 10]),
        Err(FfsError::Overflow {
            received: 100,
            capacity: 10
        })
    );
    assert_eq!(host.join().unwrap(), Ok(100));
}

#[test]
fn test_interrupted_read_is_not_resubmitted() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let interrupt = reader.interrupt();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            assert!(harness::eventually(|| rig.controller.pending(EP_OUT) == 1));
            interrupt.raise();
        });
        reader.read(&mut [0u8; 16])
    });
    assert_eq!(result, Err(FfsError::Interrupted));
    assert_eq!(rig.controller.pending(EP_OUT), 0);

    let mut buf = [0u8; 16];
    let n = thread::scope(|scope| {
        scope.spawn(|| {
            assert!(harness::eventually(|| rig.controller.pending(EP_OUT) == 1));
            thread::sleep(Duration::from_millis(20));
            assert_eq!(rig.controller.pending(EP_OUT), 1);
            rig.controller.host_write(EP_OUT, b"later", HOST_TIMEOUT).unwrap();
        });
        reader.read(&mut buf)
    });
    assert_eq!(n, Ok(5));
    assert_eq!(&buf[..5], b"later");
    assert_eq!(rig.controller.pending(EP_OUT), 0);
}

#[test]
fn test_failed_enable_unbinds_files() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let function = rig.bound(&session);
    let interface = u16::from(function.interface_number(0).unwrap());
    let mut writer = session.open_endpoint("ep1", harness::waiter()).unwrap();

    rig.controller.endpoint(EP_OUT).unwrap().fail_next_enable();
    assert_eq!(
        function.set_alt(interface, Some(0)),
        Err(FfsError::OutOfResources)
    );
    assert!(!rig.controller.endpoint(EP_IN).unwrap().is_enabled());
    assert_eq!(writer.endpoint_revmap(), Err(FfsError::DeviceGone));
    assert_eq!(writer.write(b"stale"), Err(FfsError::DeviceGone));

    drop(writer);
    function.set_alt(interface, Some(0)).unwrap();
    let writer = session.open_endpoint("ep1", harness::waiter()).unwrap();
    assert_eq!(writer.endpoint_revmap(), Ok(1));
}

// ============================================================================
// Endpoint disable
// ============================================================================

#[test]
fn test_disable_fails_later_reads() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let function = rig.enabled(&session);
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let controller = rig.controller.clone();
    let host = thread::spawn(move || controller.host_write(EP_OUT, b"a", HOST_TIMEOUT));
    assert_eq!(reader.read(&mut [0u8; 8]), Ok(1));
    host.join().unwrap().unwrap();

    function.disable().unwrap();
    assert_eq!(reader.read(&mut [0u8; 8]), Err(FfsError::DeviceGone));
    assert_eq!(reader.fifo_status(), Err(FfsError::DeviceGone));

    // Reopening clears the error
    drop(reader);
    let interface = function.interface_number(0).unwrap();
    function.set_alt(u16::from(interface), Some(0)).unwrap();
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();
    assert_eq!(reader.fifo_status(), Ok(0));
}

#[test]
fn test_first_read_survives_endpoint_cycle() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let function = rig.enabled(&session);
    let interface = u16::from(function.interface_number(0).unwrap());
    let mut reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let mut buf = [0u8; 16];
    let n = thread::scope(|scope| {
        scope.spawn(|| {
            assert!(harness::eventually(|| rig.controller.pending(EP_OUT) == 1));
            function.disable().unwrap();
            function.set_alt(interface, Some(0)).unwrap();
            rig.controller.host_write(EP_OUT, b"again", HOST_TIMEOUT).unwrap();
        });
        reader.read(&mut buf)
    });
    assert_eq!(n, Ok(5));
    assert_eq!(&buf[..5], b"again");
}

// ============================================================================
// Endpoint queries
// ============================================================================

#[test]
fn test_endpoint_queries() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();
    assert_eq!(reader.endpoint_revmap(), Err(FfsError::DeviceGone));

    let _function = rig.enabled(&session);
    assert_eq!(reader.slot(), 2);
    assert_eq!(reader.endpoint_revmap(), Ok(2));
    assert_eq!(reader.fifo_status(), Ok(0));
    assert!(reader.fifo_flush().is_ok());
    let desc = reader.endpoint_descriptor().unwrap();
    assert_eq!(desc.max_packet_size, 512);
    assert_eq!(desc.address, EP_OUT);

    rig.controller.set_speed(UsbSpeed::Super);
    assert!(matches!(
        reader.endpoint_descriptor(),
        Err(FfsError::InvalidArgument(_))
    ));
}

// ============================================================================
// Asynchronous I/O
// ============================================================================

#[tokio::test]
async fn test_cancelled_write_completes_once() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let writer = session.open_endpoint("ep1", harness::waiter()).unwrap();

    let request = writer.submit_write(b"never read".to_vec()).unwrap();
    assert_eq!(rig.controller.pending(EP_IN), 1);
    writer.cancel(&request.ticket).unwrap();

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, request.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Err(FfsError::Cancelled));
    assert!(matches!(
        writer.cancel(&request.ticket),
        Err(FfsError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_async_read_signals_notifier() {
    let rig = Rig::new();
    let notifier = rig.host.register_notifier(5);
    let fixture = FunctionFixture::bulk_loopback().with_notify_handle(5);
    let (_control, session) = rig.active("usb0", &fixture);
    let _function = rig.enabled(&session);
    let before = notifier.count();
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let request = reader.submit_read(64).unwrap();
    rig.controller.host_write(EP_OUT, b"async", HOST_TIMEOUT).unwrap();
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, request.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(AioOutcome::Read(b"async".to_vec())));
    assert!(harness::eventually(|| notifier.count() == before + 1));
}

#[tokio::test]
async fn test_completion_survives_closed_work_queue() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let request = reader.submit_read(64).unwrap();
    rig.close_work_queue();
    rig.controller.host_write(EP_OUT, b"late", HOST_TIMEOUT).unwrap();
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, request.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(AioOutcome::Read(b"late".to_vec())));
}

#[tokio::test]
async fn test_async_write_completes() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let writer = session.open_endpoint("ep1", harness::waiter()).unwrap();

    let request = writer.submit_write(b"queued".to_vec()).unwrap();
    assert_eq!(
        rig.controller.host_read(EP_IN, 64, HOST_TIMEOUT),
        Ok(b"queued".to_vec())
    );
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, request.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(AioOutcome::Written(6)));
}

#[tokio::test]
async fn test_cancel_after_disable_is_rejected() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let function = rig.enabled(&session);
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();

    let request = reader.submit_read(32).unwrap();
    function.disable().unwrap();
    assert!(matches!(
        reader.cancel(&request.ticket),
        Err(FfsError::InvalidArgument(_))
    ));

    let interface = function.interface_number(0).unwrap();
    function.set_alt(u16::from(interface), Some(0)).unwrap();
    assert!(matches!(
        reader.cancel(&request.ticket),
        Err(FfsError::InvalidArgument(_))
    ));

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, request.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Err(FfsError::DeviceGone));
}

#[tokio::test]
async fn test_async_direction_mismatch_halts() {
    let rig = Rig::new();
    let (_control, session) = rig.active("usb0", &FunctionFixture::bulk_loopback());
    let _function = rig.enabled(&session);
    let reader = session.open_endpoint("ep2", harness::waiter()).unwrap();
    assert!(matches!(
        reader.submit_write(b"x".to_vec()),
        Err(FfsError::Halted)
    ));
}
