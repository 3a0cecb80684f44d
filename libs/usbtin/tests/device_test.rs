//! Device integration tests against the scripted mock adapter

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::time::Duration;

use tokio::sync::mpsc;
use usbtin::transport::{MockHandle, MockTransport, MockTransportConfig};
use usbtin::{
    CanFrame, Device, DeviceConfig, DeviceState, FilterChain, FilterMask, FilterValue, OpenMode,
    UsbtinError,
};

const BELL: &[u8] = &[0x07];

macro_rules! wait_for {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..200 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reached, "timed out waiting for {}", stringify!($cond));
    }};
}

fn test_config() -> DeviceConfig {
    DeviceConfig {
        command_timeout_ms: 200,
        settle_delay_ms: 1,
        poll_interval_ms: 2,
        ..DeviceConfig::default()
    }
}

fn mock() -> (MockTransport, MockHandle) {
    let transport = MockTransport::new(MockTransportConfig::default()).unwrap();
    let handle = transport.handle();
    (transport, handle)
}

async fn connected_device() -> (Device, MockHandle) {
    let (transport, handle) = mock();
    handle.script_handshake("0107", "0100", "B0123").await;

    let mut device = Device::new(test_config());
    device.connect_with(Box::new(transport)).await.unwrap();
    handle.clear_sent_data().await;
    (device, handle)
}

async fn open_device(baud: u32, mode: OpenMode) -> (Device, MockHandle) {
    let (mut device, handle) = connected_device().await;
    handle.set_default_reply(Some(b"\r".as_slice())).await;
    device.open_channel(baud, mode).await.unwrap();
    handle.set_default_reply(None).await;
    handle.clear_sent_data().await;
    (device, handle)
}

#[tokio::test]
async fn test_handshake_sequence_and_identity() {
    let (transport, handle) = mock();
    handle.script_handshake("0107", "0100", "B0123").await;

    let mut device = Device::new(test_config());
    device.connect_with(Box::new(transport)).await.unwrap();

    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(device.firmware_version(), Some("0107"));
    assert_eq!(device.hardware_version(), Some("0100"));
    assert_eq!(device.serial_number(), Some("B0123"));
    assert_eq!(
        handle.sent_lines().await,
        vec!["\rC\r", "C\r", "v\r", "V\r", "N\r", "W2d00\r"]
    );

    let stats = device.transport_stats().await.unwrap();
    assert_eq!(stats.purges, 1);
}

#[tokio::test]
async fn test_handshake_timeout_leaves_device_disconnected() {
    let (transport, handle) = mock();
    handle.reply_to(b"C\r", b"\r").await;

    let mut device = Device::new(test_config());
    let err = device.connect_with(Box::new(transport)).await.unwrap_err();

    assert!(matches!(err, UsbtinError::Connect(ref m) if m.contains("firmware version")));
    assert_eq!(device.state(), DeviceState::Disconnected);
    assert_eq!(device.firmware_version(), None);
    assert!(!handle.is_connected().await);
}

#[tokio::test]
async fn test_handshake_rejected_query() {
    let (transport, handle) = mock();
    handle.reply_to(b"C\r", b"\r").await;
    handle.reply_to(b"v\r", b"v0107\r").await;
    handle.reply_to(b"V\r", BELL).await;

    let mut device = Device::new(test_config());
    let err = device.connect_with(Box::new(transport)).await.unwrap_err();
    assert!(matches!(err, UsbtinError::Connect(ref m) if m.contains("hardware version")));
    assert_eq!(device.state(), DeviceState::Disconnected);
    assert_eq!(device.firmware_version(), None);
}

#[tokio::test]
async fn test_transport_open_failure() {
    let config = MockTransportConfig {
        should_fail_connection: true,
        ..MockTransportConfig::default()
    };
    let transport = MockTransport::new(config).unwrap();

    let mut device = Device::new(test_config());
    let err = device.connect_with(Box::new(transport)).await.unwrap_err();
    assert!(matches!(err, UsbtinError::Connect(_)));
    assert_eq!(device.state(), DeviceState::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (mut device, _handle) = connected_device().await;
    let (transport, _) = mock();

    let err = device.connect_with(Box::new(transport)).await.unwrap_err();
    assert!(matches!(err, UsbtinError::InvalidState { operation: "connect", .. }));
    assert_eq!(device.state(), DeviceState::Connected);
}

#[tokio::test]
async fn test_set_filter_writes_registers_in_order() {
    let (mut device, handle) = connected_device().await;
    handle.set_default_reply(Some(b"\r".as_slice())).await;

    let chain = FilterChain::new(
        FilterMask::standard(0x7FF, 0, 0),
        vec![FilterValue::standard(0x123, 0, 0)],
    );
    device.set_filter(&[chain]).await.unwrap();

    let sent = handle.sent_lines().await;
    assert_eq!(sent.len(), 32);
    assert_eq!(&sent[..4], &["W20ff\r", "W21e0\r", "W2200\r", "W2300\r"]);
    assert_eq!(&sent[4..8], &["W0024\r", "W0160\r", "W0200\r", "W0300\r"]);
    assert_eq!(&sent[12..16], &["W24ff\r", "W25e0\r", "W2600\r", "W2700\r"]);
}

#[tokio::test]
async fn test_set_filter_accept_all() {
    let (mut device, handle) = connected_device().await;
    handle.set_default_reply(Some(b"\r".as_slice())).await;

    device.set_filter(&[]).await.unwrap();
    let sent = handle.sent_lines().await;
    assert_eq!(sent.len(), 8);
    assert!(sent.iter().all(|line| line.ends_with("00\r")));
}

#[tokio::test]
async fn test_set_filter_errors() {
    let (mut device, handle) = connected_device().await;
    handle.set_default_reply(Some(b"\r".as_slice())).await;

    let chain = FilterChain::new(FilterMask::open(), vec![]);
    let err = device
        .set_filter(&[chain.clone(), chain.clone(), chain])
        .await
        .unwrap_err();
    assert!(matches!(err, UsbtinError::TooManyFilterChains { count: 3 }));
    assert!(handle.sent_data().await.is_empty());

    handle.set_default_reply(Some(BELL)).await;
    let err = device.set_filter(&[]).await.unwrap_err();
    assert!(matches!(err, UsbtinError::DeviceRejected(_)));
    assert_eq!(device.state(), DeviceState::Connected);
}

#[tokio::test]
async fn test_open_channel_preset_and_custom() {
    let (mut device, handle) = connected_device().await;
    handle.set_default_reply(Some(b"\r".as_slice())).await;

    device.open_channel(500_000, OpenMode::Active).await.unwrap();
    assert_eq!(device.state(), DeviceState::ChannelOpen);
    assert_eq!(handle.sent_lines().await, vec!["S6\r", "O\r"]);

    device.close_channel().await.unwrap();
    handle.clear_sent_data().await;

    device.open_channel(83_333, OpenMode::Loopback).await.unwrap();
    assert_eq!(handle.sent_lines().await, vec!["scb9303\r", "l\r"]);

    let err = device.set_filter(&[]).await.unwrap_err();
    assert!(matches!(err, UsbtinError::InvalidState { operation: "set_filter", .. }));
}

#[tokio::test]
async fn test_open_channel_rejected_stays_connected() {
    let (mut device, handle) = connected_device().await;
    handle.reply_to(b"S4\r", BELL).await;

    let err = device.open_channel(125_000, OpenMode::ListenOnly).await.unwrap_err();
    assert!(matches!(err, UsbtinError::DeviceRejected(ref c) if c == "S4"));
    assert_eq!(device.state(), DeviceState::Connected);

    let err = device.open_channel(0, OpenMode::Active).await.unwrap_err();
    assert!(matches!(err, UsbtinError::InvalidBaudRate(0)));
}

#[tokio::test]
async fn test_send_ack_and_nak() {
    let (device, handle) = open_device(250_000, OpenMode::Active).await;

    device
        .send(CanFrame::new(0x123, vec![0x11, 0x22]).unwrap())
        .await
        .unwrap();
    device.send(CanFrame::remote(0x456, 2).unwrap()).await.unwrap();
    assert_eq!(handle.sent_lines().await, vec!["t12321122\r"]);
    assert_eq!(device.pending_frames().await, 2);

    handle.push_receive_data(BELL).await;
    wait_for!(handle.sent_data().await.len() == 2);
    assert_eq!(handle.sent_lines().await[1], "t12321122\r");

    handle.push_receive_data(b"z\r").await;
    wait_for!(device.pending_frames().await == 1);
    assert_eq!(handle.sent_lines().await[2], "r4562\r");

    handle.push_receive_data(b"z\r").await;
    wait_for!(device.pending_frames().await == 0);
    assert_eq!(handle.sent_data().await.len(), 3);
}

#[tokio::test]
async fn test_listeners_receive_frames() {
    let (device, handle) = open_device(125_000, OpenMode::ListenOnly).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = device.add_listener(move |frame: &CanFrame| {
        let _ = tx.send(frame.clone());
    });

    handle.push_receive_data(b"t1230\rT12345678197\r").await;

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, CanFrame::new(0x123, vec![]).unwrap());
    assert_eq!(second, CanFrame::new(0x1234_5678, vec![0x97]).unwrap());

    assert!(device.remove_listener(id));
    assert!(!device.remove_listener(id));
}

#[tokio::test]
async fn test_close_channel() {
    let (mut device, handle) = open_device(125_000, OpenMode::Active).await;
    handle.reply_to(b"C\r", b"\r").await;

    device.close_channel().await.unwrap();
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(handle.sent_lines().await, vec!["C\r"]);
    assert_eq!(handle.pending_receive_len().await, 0);
    assert_eq!(device.firmware_version(), None);

    let err = device
        .send(CanFrame::new(0x1, vec![]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, UsbtinError::InvalidState { .. }));
}

#[tokio::test]
async fn test_disconnect_from_open_channel() {
    let (mut device, handle) = open_device(125_000, OpenMode::Active).await;
    device
        .send(CanFrame::new(0x1, vec![]).unwrap())
        .await
        .unwrap();

    device.disconnect().await.unwrap();
    assert_eq!(device.state(), DeviceState::Disconnected);
    assert_eq!(device.serial_number(), None);
    assert_eq!(device.pending_frames().await, 0);
    assert!(!handle.is_connected().await);
}

#[tokio::test]
async fn test_listener_registered_before_connect() {
    let device = Device::new(test_config());
    let id = device.add_listener(|_: &CanFrame| {});
    assert!(device.remove_listener(id));
}

#[tokio::test]
async fn test_close_channel_without_reply() {
    let (mut device, handle) = open_device(125_000, OpenMode::Active).await;

    device.close_channel().await.unwrap();
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(handle.sent_lines().await, vec!["C\r"]);
}

#[tokio::test]
async fn test_close_reply_does_not_shift_next_open() {
    let (mut device, handle) = open_device(125_000, OpenMode::Active).await;
    handle.reply_to(b"C\r", b"\r").await;
    device.close_channel().await.unwrap();

    handle.reply_to(b"S6\r", b"\r").await;
    handle.reply_to(b"O\r", BELL).await;
    let err = device.open_channel(500_000, OpenMode::Active).await.unwrap_err();
    assert!(matches!(err, UsbtinError::DeviceRejected(ref c) if c == "O"));
    assert_eq!(device.state(), DeviceState::Connected);
}

#[tokio::test]
async fn test_send_fails_once_reader_is_gone() {
    let (device, handle) = open_device(125_000, OpenMode::Active).await;
    device
        .send(CanFrame::new(0x1, vec![]).unwrap())
        .await
        .unwrap();

    handle.set_receive_failure(true).await;
    wait_for!(device
        .send(CanFrame::new(0x2, vec![]).unwrap())
        .await
        .is_err());

    let err = device
        .send(CanFrame::new(0x3, vec![]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, UsbtinError::DeviceIo(_)));
    assert_eq!(handle.sent_lines().await, vec!["t0010\r"]);
}
