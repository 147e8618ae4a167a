mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{Fixture, WAIT, cart_peripheral, cart_services, uuid16};
use smartcart_link_lib::config::link_config::LinkConfig;
use smartcart_link_lib::core::bluetooth::{
    CartCommand, GpsSample, LinkError, LinkEvent, LinkState, PermissionState, ServiceInfo,
    encode_command, frame, receiver_stream,
};
use smartcart_link_lib::core::cart::Ceiling;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_missing_cart_service_returns_to_scanning() {
    let mut fixture = Fixture::new(vec![ServiceInfo {
        uuid: uuid16(0x180a),
        characteristics: vec![uuid16(0x2a29)],
    }])
    .await;
    let peripheral = fixture.discover().await;

    let result = fixture.session.connect(&peripheral).await;
    assert!(matches!(result, Err(LinkError::ServiceNotFound(_))));

    assert_eq!(fixture.session.state().await, LinkState::Scanning);
    assert!(fixture.session.link_handle().await.is_none());
    // The half-open connection is dropped and a fresh scan started
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.transport.scan_starts.load(Ordering::SeqCst), 2);
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::ConnectionFailed { .. }))
        .await;
}

#[tokio::test]
async fn test_missing_characteristic_fails_connect() {
    let mut fixture = Fixture::new(vec![ServiceInfo {
        uuid: uuid16(0xfff0),
        characteristics: vec![uuid16(0xfff1)],
    }])
    .await;
    let peripheral = fixture.discover().await;

    let result = fixture.session.connect(&peripheral).await;
    assert!(matches!(result, Err(LinkError::CharacteristicNotFound(_))));
    assert_eq!(fixture.session.state().await, LinkState::Scanning);
}

#[tokio::test]
async fn test_refused_connection_resumes_scanning() {
    let mut fixture = Fixture::new(cart_services()).await;
    let peripheral = fixture.discover().await;
    fixture.transport.fail_connect.store(true, Ordering::SeqCst);

    let result = fixture.session.connect(&peripheral).await;
    assert!(matches!(result, Err(LinkError::ConnectionFailed { .. })));
    assert_eq!(fixture.session.state().await, LinkState::Scanning);
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_notification_setup_failure_resumes_scanning() {
    let mut fixture = Fixture::new(cart_services()).await;
    let peripheral = fixture.discover().await;
    fixture.transport.fail_subscribe.store(true, Ordering::SeqCst);

    let result = fixture.session.connect(&peripheral).await;
    assert!(matches!(result, Err(LinkError::ConnectionFailed { .. })));

    assert_eq!(fixture.session.state().await, LinkState::Scanning);
    assert!(fixture.session.link_handle().await.is_none());
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.transport.scan_starts.load(Ordering::SeqCst), 2);
    fixture.events.drain(Duration::from_millis(50)).await;
    assert_eq!(
        fixture
            .events
            .count(|e| matches!(e, LinkEvent::Connected(_))),
        0
    );
    assert!(matches!(
        fixture.session.send_command(CartCommand::Stop).await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = LinkConfig {
        connect_timeout_ms: 50,
        ..LinkConfig::default()
    };
    let mut fixture = Fixture::with_config(cart_services(), config).await;
    let peripheral = fixture.discover().await;
    fixture.transport.set_connect_delay(Duration::from_secs(5));

    let started = Instant::now();
    let result = fixture.session.connect(&peripheral).await;
    match result {
        Err(LinkError::ConnectionFailed { reason, .. }) => {
            assert!(reason.contains("timed out"), "{}", reason)
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(started.elapsed() < WAIT);

    assert_eq!(fixture.session.state().await, LinkState::Scanning);
    assert_eq!(fixture.transport.connects.load(Ordering::SeqCst), 0);
    // Nothing was established, so there is nothing to drop
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_service_discovery_timeout_drops_connection() {
    let config = LinkConfig {
        resolve_timeout_ms: 50,
        ..LinkConfig::default()
    };
    let mut fixture = Fixture::with_config(cart_services(), config).await;
    let peripheral = fixture.discover().await;
    fixture.transport.set_discover_delay(Duration::from_secs(5));

    let result = fixture.session.connect(&peripheral).await;
    match result {
        Err(LinkError::ConnectionFailed { reason, .. }) => {
            assert!(reason.contains("service discovery timed out"), "{}", reason)
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(fixture.session.state().await, LinkState::Scanning);
    assert_eq!(fixture.transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_brings_link_up() {
    let mut fixture = Fixture::connected().await;

    let handle = fixture.session.link_handle().await.unwrap();
    assert_eq!(handle.peripheral.id, "cart-1");
    assert_eq!(handle.service, uuid16(0xfff0));
    assert_eq!(handle.inbound, uuid16(0xfff2));
    assert_eq!(handle.outbound, uuid16(0xfff1));
    assert_eq!(fixture.session.state().await, LinkState::Connected);
    // Scan results are cleared once connected
    assert!(fixture.session.peripherals().await.is_empty());
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::Connected(p) if p.id == "cart-1"))
        .await;
}

#[tokio::test]
async fn test_unsolicited_disconnect_tears_down_once() {
    let mut fixture = Fixture::connected().await;
    let (gps_tx, gps_rx) = mpsc::channel(4);
    fixture
        .session
        .start_telemetry(receiver_stream(gps_rx))
        .await
        .unwrap();
    let notify_tx = fixture.transport.notify_sender().unwrap();

    fixture.transport.drop_link();

    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::PeripheralLost { .. }))
        .await;
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::StateChanged(LinkState::Scanning)))
        .await;
    fixture.events.drain(Duration::from_millis(50)).await;

    assert_eq!(
        fixture.events.count(|e| matches!(
            e,
            LinkEvent::Disconnected {
                unsolicited: true,
                ..
            }
        )),
        1
    );
    assert_eq!(
        fixture
            .events
            .count(|e| matches!(e, LinkEvent::PeripheralLost { .. })),
        1
    );

    // Both the GPS watcher and the notification subscription let go of their streams
    tokio::time::timeout(WAIT, gps_tx.closed()).await.unwrap();
    tokio::time::timeout(WAIT, notify_tx.closed()).await.unwrap();

    assert_eq!(fixture.transport.scan_starts.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 1);
    assert!(fixture.session.link_handle().await.is_none());
    assert!(matches!(
        fixture.session.disconnect().await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn test_requested_disconnect_is_not_reported_as_lost() {
    let mut fixture = Fixture::connected().await;

    fixture.session.disconnect().await.unwrap();
    // A late signal from the transport must not tear anything down again
    fixture.transport.drop_link();
    fixture.events.drain(Duration::from_millis(50)).await;

    assert_eq!(
        fixture.events.count(|e| matches!(
            e,
            LinkEvent::Disconnected {
                unsolicited: false,
                ..
            }
        )),
        1
    );
    assert_eq!(
        fixture
            .events
            .count(|e| matches!(e, LinkEvent::Disconnected { .. })),
        1
    );
    assert_eq!(
        fixture
            .events
            .count(|e| matches!(e, LinkEvent::PeripheralLost { .. })),
        0
    );
    assert_eq!(fixture.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.session.state().await, LinkState::Scanning);
}

#[tokio::test]
async fn test_tag_scans_respect_stock_ceiling() {
    let mut fixture = Fixture::connected().await;

    for _ in 0..3 {
        fixture.transport.notify(b"RFID:P1").await;
    }

    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::CartUpdated { quantity: 1, .. }))
        .await;
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::CartUpdated { quantity: 2, .. }))
        .await;
    let exhausted = fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::StockExhausted { .. }))
        .await;
    assert_eq!(
        exhausted,
        LinkEvent::StockExhausted {
            item_id: "P1".to_string(),
            name: "Milk".to_string(),
        }
    );

    let entry = fixture.ledger.entry("P1").unwrap();
    assert_eq!(entry.quantity, 2);
    assert_eq!(entry.ceiling, Ceiling::Limited(2));
}

#[tokio::test]
async fn test_unknown_and_foreign_notifications() {
    let mut fixture = Fixture::connected().await;

    fixture.transport.notify(b"HELLO").await;
    fixture.transport.notify(b"RFID:").await;
    fixture.transport.notify(b"RFID:NOPE").await;
    // Not valid base64
    fixture
        .transport
        .notify_sender()
        .unwrap()
        .send(b"%%%".to_vec())
        .await
        .unwrap();
    fixture.transport.notify(b"RFID:P2").await;

    let unknown = fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::UnknownItem { .. }))
        .await;
    assert_eq!(
        unknown,
        LinkEvent::UnknownItem {
            item_id: "NOPE".to_string()
        }
    );
    fixture
        .events
        .wait_for(|e| {
            matches!(e, LinkEvent::CartUpdated { item_id, quantity: 1 } if item_id == "P2")
        })
        .await;

    assert_eq!(fixture.ledger.snapshot(), vec![("P2".to_string(), 1)]);
    assert_eq!(fixture.session.state().await, LinkState::Connected);
}

#[tokio::test]
async fn test_connect_clears_previous_cart() {
    let mut fixture = Fixture::new(cart_services()).await;
    fixture.ledger.add("OLD", Ceiling::Unbounded);
    let peripheral = fixture.discover().await;

    fixture.session.connect(&peripheral).await.unwrap();
    assert!(fixture.ledger.is_empty());
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let mut fixture = Fixture::new(cart_services()).await;
    let peripheral = fixture.discover().await;
    fixture
        .transport
        .set_connect_delay(Duration::from_millis(100));

    let session = fixture.session.clone();
    let target = peripheral.clone();
    let first = tokio::spawn(async move { session.connect(&target).await });
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::StateChanged(LinkState::Connecting)))
        .await;

    let second = fixture.session.connect(&peripheral).await;
    assert!(matches!(
        second,
        Err(LinkError::SessionBusy(LinkState::Connecting))
    ));

    first.await.unwrap().unwrap();
    let third = fixture.session.connect(&peripheral).await;
    assert!(matches!(
        third,
        Err(LinkError::SessionBusy(LinkState::Connected))
    ));
    assert_eq!(fixture.transport.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_requires_connection() {
    let fixture = Fixture::new(cart_services()).await;

    let result = fixture.session.send_command(CartCommand::Up).await;
    assert!(matches!(result, Err(LinkError::NotConnected)));
    let result = fixture
        .session
        .send_telemetry(GpsSample::new(3.139, 101.6869))
        .await;
    assert!(matches!(result, Err(LinkError::NotConnected)));
    assert!(fixture.transport.writes().is_empty());
}

#[tokio::test]
async fn test_commands_are_written_in_order() {
    let fixture = Fixture::connected().await;
    fixture.transport.set_write_delay(Duration::from_millis(5));

    for command in [CartCommand::Up, CartCommand::Left, CartCommand::Stop] {
        fixture.session.send_command(command).await.unwrap();
    }

    assert_eq!(
        fixture.transport.writes(),
        vec![
            encode_command("UP"),
            encode_command("LEFT"),
            encode_command("STOP"),
        ]
    );
}

#[tokio::test]
async fn test_stop_is_not_dropped_during_telemetry() {
    let fixture = Fixture::connected().await;
    fixture.transport.set_write_delay(Duration::from_millis(20));
    let (gps_tx, gps_rx) = mpsc::channel(4);
    fixture
        .session
        .start_telemetry(receiver_stream(gps_rx))
        .await
        .unwrap();

    gps_tx.send(GpsSample::new(3.139, 101.6869)).await.unwrap();
    // Give the watcher a chance to queue its write first
    tokio::time::sleep(Duration::from_millis(5)).await;
    fixture.session.send_command(CartCommand::Stop).await.unwrap();

    let telemetry = frame(b"3.139000,101.686900");
    let writes = fixture.transport.writes();
    assert!(writes.contains(&encode_command("STOP")));
    tokio::time::timeout(WAIT, async {
        while !fixture.transport.writes().contains(&telemetry) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(fixture.transport.writes().len(), 2);
}

#[tokio::test]
async fn test_unacknowledged_write_times_out() {
    let config = LinkConfig {
        write_timeout_ms: 50,
        ..LinkConfig::default()
    };
    let fixture = Fixture::connected_with_config(config).await;
    fixture.transport.set_write_delay(Duration::from_secs(5));

    let result = fixture.session.send_command(CartCommand::Up).await;
    match result {
        Err(LinkError::WriteError(reason)) => {
            assert_eq!(reason, "UP not acknowledged within 50 ms")
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(fixture.transport.writes().is_empty());
    assert_eq!(fixture.session.state().await, LinkState::Connected);

    // The writer keeps serving the link afterwards
    fixture.transport.set_write_delay(Duration::ZERO);
    fixture.session.send_command(CartCommand::Stop).await.unwrap();
    assert_eq!(fixture.transport.writes(), vec![encode_command("STOP")]);
}

#[tokio::test]
async fn test_teardown_fails_queued_writes() {
    let fixture = Fixture::connected().await;
    fixture.transport.set_write_delay(Duration::from_millis(200));

    let session = fixture.session.clone();
    let up = tokio::spawn(async move { session.send_command(CartCommand::Up).await });
    // UP is now being written
    tokio::time::sleep(Duration::from_millis(20)).await;
    let session = fixture.session.clone();
    let stop = tokio::spawn(async move { session.send_command(CartCommand::Stop).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    fixture.session.disconnect().await.unwrap();

    assert!(up.await.unwrap().is_ok());
    assert!(matches!(stop.await.unwrap(), Err(LinkError::NotConnected)));
    assert_eq!(fixture.transport.writes(), vec![encode_command("UP")]);
    assert_eq!(fixture.session.state().await, LinkState::Scanning);
}

#[tokio::test]
async fn test_telemetry_filter_skips_nearby_fixes() {
    let fixture = Fixture::connected().await;
    let (gps_tx, gps_rx) = mpsc::channel(4);
    fixture
        .session
        .start_telemetry(receiver_stream(gps_rx))
        .await
        .unwrap();

    gps_tx.send(GpsSample::new(3.139, 101.6869)).await.unwrap();
    // Same place, immediately after
    gps_tx.send(GpsSample::new(3.139, 101.6869)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fixture.transport.writes().len(), 1);
    assert!(fixture.session.is_telemetry_running().await);
}

#[tokio::test]
async fn test_write_failure_is_reported() {
    let mut fixture = Fixture::connected().await;
    fixture.transport.fail_writes.store(true, Ordering::SeqCst);

    let result = fixture.session.send_command(CartCommand::Start).await;
    assert!(matches!(result, Err(LinkError::WriteError(_))));

    let (gps_tx, gps_rx) = mpsc::channel(4);
    fixture
        .session
        .start_telemetry(receiver_stream(gps_rx))
        .await
        .unwrap();
    gps_tx.send(GpsSample::new(3.139, 101.6869)).await.unwrap();
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::WriteFailed { .. }))
        .await;
    // The link survives a failed write
    assert_eq!(fixture.session.state().await, LinkState::Connected);
}

#[tokio::test]
async fn test_scan_requires_permission() {
    let mut fixture = Fixture::new(cart_services()).await;

    assert!(matches!(
        fixture.session.start_scan().await,
        Err(LinkError::PermissionDenied)
    ));
    fixture.session.set_permission(PermissionState::Denied).await;
    assert!(matches!(
        fixture.session.start_scan().await,
        Err(LinkError::PermissionDenied)
    ));
    assert_eq!(fixture.transport.scan_starts.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.session.state().await, LinkState::Idle);
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::PermissionChanged(PermissionState::Denied)))
        .await;
}

#[tokio::test]
async fn test_scan_failure_leaves_session_idle() {
    let mut fixture = Fixture::new(cart_services()).await;
    fixture.session.set_permission(PermissionState::Granted).await;
    fixture.transport.fail_scan.store(true, Ordering::SeqCst);

    let result = fixture.session.start_scan().await;
    assert!(matches!(result, Err(LinkError::ScanError(_))));
    assert_eq!(fixture.session.state().await, LinkState::Idle);
    assert_eq!(fixture.transport.scan_starts.load(Ordering::SeqCst), 0);
    fixture.events.drain(Duration::from_millis(20)).await;
    assert_eq!(
        fixture
            .events
            .count(|e| matches!(e, LinkEvent::ScanStarted)),
        0
    );
}

#[tokio::test]
async fn test_failed_connect_without_scanner_goes_idle() {
    let mut fixture = Fixture::new(cart_services()).await;
    let peripheral = fixture.discover().await;
    fixture.transport.fail_scan.store(true, Ordering::SeqCst);
    fixture.transport.fail_connect.store(true, Ordering::SeqCst);

    let result = fixture.session.connect(&peripheral).await;
    assert!(matches!(result, Err(LinkError::ConnectionFailed { .. })));
    assert_eq!(fixture.session.state().await, LinkState::Idle);
}

#[tokio::test]
async fn test_rescan_lists_cart_again() {
    let mut fixture = Fixture::new(cart_services()).await;
    fixture.discover().await;
    assert_eq!(fixture.session.peripherals().await.len(), 1);

    fixture.session.start_scan().await.unwrap();
    assert!(fixture.session.peripherals().await.is_empty());
    fixture.transport.advertise(cart_peripheral()).await;
    fixture
        .events
        .wait_for(|e| matches!(e, LinkEvent::PeripheralFound(_)))
        .await;
    assert!(fixture.session.find_peripheral("cart 1").await.is_some());
}
