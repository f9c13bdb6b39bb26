//! Bootstrap and connection behaviour against a fake daemon

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{notification_name, request_name, FakeDaemon, HandshakeMode};
use nihia_device::{
    event_queue, BootstrapFailure, Client, ConnectionError, ConnectionOptions, ConnectionState,
    DeviceRegistry, EventSink,
};
use nihia_transport::protocol::msg;
use nihia_transport::{encode_notification, ChannelRole, DeviceTypeId, KeyZone, NotificationEvent};

const MK3: DeviceTypeId = DeviceTypeId::MASCHINE_MK3;

/// Stall threshold high enough that idle polls never trigger a re-subscribe
fn quiet_options() -> ConnectionOptions {
    ConnectionOptions {
        stall_threshold: 10_000,
        ..ConnectionOptions::default()
    }
}

fn client(daemon: &FakeDaemon, options: ConnectionOptions) -> Client {
    Client::with_registry(
        Arc::new(daemon.clone()),
        Arc::new(DeviceRegistry::new()),
        options,
    )
}

#[test]
fn test_global_bootstrap_sequence() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());

    let conn = client.connect(MK3, "", EventSink::Discard).unwrap();
    assert!(conn.is_global());
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.notification_channel(), notification_name(""));

    {
        let state = daemon.state.lock();
        assert_eq!(state.handshakes, vec![String::new()]);
        assert_eq!(state.acked, vec![notification_name("")]);
        assert!(state
            .opened
            .contains(&(request_name(""), ChannelRole::Remote)));
        assert!(state
            .opened
            .contains(&(notification_name(""), ChannelRole::Local)));
    }
    assert_eq!(
        daemon.messages_on(&request_name("")),
        vec!["ACKNOWLEDGE_PORT", "REQUEST_DEVICE_STATE"]
    );
    client.shutdown_all();
    assert_eq!(conn.state(), ConnectionState::ShutDown);
}

#[test]
fn test_device_connection_creates_global_first() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());

    let conn = client.connect(MK3, "ABC123", EventSink::Discard).unwrap();
    assert!(!conn.is_global());
    assert_eq!(conn.serial(), "ABC123");

    assert_eq!(
        daemon.state.lock().handshakes,
        vec![String::new(), "ABC123".to_string()]
    );
    assert_eq!(
        daemon.messages_on(&request_name("ABC123")),
        vec!["ACKNOWLEDGE_PORT", "ACQUIRE_CONTROL"]
    );
}

#[test]
fn test_connections_are_memoized() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());

    let a = client.connect(MK3, "X", EventSink::Discard).unwrap();
    let b = client.connect(MK3, "X", EventSink::Discard).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    client.connect(MK3, "", EventSink::Discard).unwrap();

    assert_eq!(daemon.state.lock().handshakes.len(), 2);
    // Bootstrap port opened once and reused
    let bootstrap_opens = daemon
        .state
        .lock()
        .opened
        .iter()
        .filter(|(name, _)| name == nihia_transport::BOOTSTRAP_PORT_NAME)
        .count();
    assert_eq!(bootstrap_opens, 1);
}

#[test]
fn test_concurrent_connects_handshake_once() {
    let daemon = FakeDaemon::new();
    let client = Arc::new(client(&daemon, quiet_options()));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            std::thread::spawn(move || client.connect(MK3, "X", EventSink::Discard).unwrap())
        })
        .collect();
    let conns: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    // One global plus one device handshake
    assert_eq!(daemon.state.lock().handshakes.len(), 2);
}

#[test]
fn test_midi_fallback_skips_acquire() {
    let daemon = FakeDaemon::new();
    let client = client(
        &daemon,
        ConnectionOptions {
            midi_fallback: true,
            ..quiet_options()
        },
    );
    client.connect(MK3, "M1", EventSink::Discard).unwrap();
    assert_eq!(daemon.count("ACQUIRE_CONTROL"), 0);
    assert_eq!(daemon.messages_on(&request_name("M1")), vec!["ACKNOWLEDGE_PORT"]);
}

fn bootstrap_error(mode: HandshakeMode) -> ConnectionError {
    let daemon = FakeDaemon::with_mode(mode);
    let client = client(&daemon, quiet_options());
    let err = client
        .connect(MK3, "", EventSink::Discard)
        .err()
        .expect("bootstrap should fail");
    assert!(daemon.state.lock().acked.is_empty());
    err
}

#[test]
fn test_four_byte_reply_is_error() {
    assert!(matches!(
        bootstrap_error(HandshakeMode::ErrorReply),
        ConnectionError::Bootstrap(BootstrapFailure::Handshake(
            nihia_transport::ProtocolError::ErrorReply(7)
        ))
    ));
}

#[test]
fn test_success_mismatch_is_error() {
    assert!(matches!(
        bootstrap_error(HandshakeMode::Mismatch),
        ConnectionError::Bootstrap(BootstrapFailure::Handshake(
            nihia_transport::ProtocolError::SuccessMismatch { .. }
        ))
    ));
}

#[test]
fn test_silent_daemon_is_error() {
    assert!(matches!(
        bootstrap_error(HandshakeMode::Silent),
        ConnectionError::Bootstrap(BootstrapFailure::NoReply)
    ));
}

#[test]
fn test_rejected_ack_is_error() {
    let daemon = FakeDaemon::new();
    daemon.state.lock().reject_ack = true;
    let client = client(&daemon, quiet_options());
    let err = client.connect(MK3, "", EventSink::Discard).err().unwrap();
    assert!(matches!(
        err,
        ConnectionError::Bootstrap(BootstrapFailure::Acknowledge(_))
    ));
    // Nothing cached: the next attempt handshakes again
    daemon.state.lock().reject_ack = false;
    client.connect(MK3, "", EventSink::Discard).unwrap();
    assert_eq!(daemon.state.lock().handshakes.len(), 2);
}

#[test]
fn test_claim_lost_triggers_acquire() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());
    let (sink, mut queue) = event_queue(16);
    client.connect(MK3, "P1", sink).unwrap();
    assert_eq!(daemon.count("ACQUIRE_CONTROL"), 1);

    daemon.notify(
        "P1",
        encode_notification(&NotificationEvent::ClaimChanged { has_claim: false }),
    );
    assert!(daemon.wait_for(|s| s
        .log
        .iter()
        .filter(|(_, m)| *m == "ACQUIRE_CONTROL")
        .count()
        == 2));
    assert_eq!(
        queue.blocking_recv(),
        Some(NotificationEvent::ClaimChanged { has_claim: false })
    );
}

#[test]
fn test_stalled_connection_resubscribes() {
    let daemon = FakeDaemon::new();
    let client = client(
        &daemon,
        ConnectionOptions {
            stall_threshold: 2,
            ..ConnectionOptions::default()
        },
    );
    client.connect(MK3, "", EventSink::Discard).unwrap();
    // Initial push plus at least one stall-triggered repeat
    assert!(daemon.wait_for(|s| s
        .log
        .iter()
        .filter(|(_, m)| *m == msg::name(msg::REQUEST_DEVICE_STATE))
        .count()
        >= 2));
}

#[test]
fn test_attach_notifications_feed_registry() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());
    daemon.notify(
        "",
        encode_notification(&NotificationEvent::DeviceStateChanged {
            device_type: MK3,
            serial: "SER-1".into(),
            attached: true,
        }),
    );

    let serial = client
        .wait_for_unique_serial(MK3, Duration::from_secs(2))
        .unwrap();
    assert_eq!(serial.as_deref(), Some("SER-1"));
    assert_eq!(client.registry().device_types(), vec![MK3]);
}

#[test]
fn test_operations_after_shutdown() {
    let daemon = FakeDaemon::new();
    let client = client(&daemon, quiet_options());
    let conn = client.connect(MK3, "Q", EventSink::Discard).unwrap();

    conn.request_focus().unwrap();
    conn.set_led_colors(&[1, 2, 3]).unwrap();
    conn.configure_keyzones(&[KeyZone {
        first_key: 0,
        last_key: 11,
        color: 4,
    }])
    .unwrap();
    assert_eq!(
        daemon.messages_on(&request_name("Q")),
        vec![
            "ACKNOWLEDGE_PORT",
            "ACQUIRE_CONTROL",
            "REQUEST_FOCUS",
            "SET_LED_COLORS",
            "CONFIGURE_KEYZONES"
        ]
    );
    assert_eq!(conn.send(&[0x00, 0x63, 0x46, 0x03]).unwrap().len(), 4);

    conn.shutdown();
    assert!(matches!(conn.request_focus(), Err(ConnectionError::ShutDown)));
}
