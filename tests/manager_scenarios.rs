mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_center_lib::core::bluetooth::{BleError, BleEvent, ConnectionState, Device, OperationKind};
use common::*;

#[tokio::test]
async fn unknown_address_is_rejected_without_native_call() {
    let mut harness = Harness::new().await;

    let result = harness.manager.connect(ADDRESS).await;

    assert_eq!(result, Err(BleError::DeviceNotFound(ADDRESS.to_string())));
    assert!(harness.fake.calls().is_empty());
    assert_eq!(
        error_messages(&harness.drain().await),
        vec!["Device not found: AA:BB".to_string()]
    );
}

#[tokio::test]
async fn every_operation_on_unknown_address_is_device_not_found() {
    let mut harness = Harness::new().await;
    let not_found = Err(BleError::DeviceNotFound(ADDRESS.to_string()));

    assert_eq!(harness.manager.disconnect(ADDRESS).await, not_found);
    assert_eq!(
        harness
            .manager
            .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
            .await,
        not_found
    );
    assert_eq!(
        harness
            .manager
            .write_characteristic(ADDRESS, HEART_RATE, BODY_SENSOR_LOCATION, vec![0x01])
            .await,
        not_found
    );
    assert_eq!(
        harness
            .manager
            .notify_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT, true)
            .await,
        not_found
    );

    assert!(harness.fake.calls().is_empty());
    assert_eq!(
        error_messages(&harness.drain().await),
        vec!["Device not found: AA:BB".to_string(); 4]
    );
}

#[tokio::test]
async fn address_from_previous_session_is_device_not_found() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;
    harness.manager.start_scan().await.unwrap();
    harness.drain().await;
    harness.fake.clear_calls();

    let result = harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await;

    assert_eq!(result, Err(BleError::DeviceNotFound(ADDRESS.to_string())));
    assert!(harness.fake.calls().is_empty());
    assert_eq!(error_messages(&harness.drain().await).len(), 1);
}

#[tokio::test]
async fn discover_connect_read_undiscovered_then_disconnect() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, Some("HR Strap"), Some(-50)).await;
    assert_eq!(
        harness.drain().await,
        vec![BleEvent::DeviceFound {
            device: Device::new(Some("HR Strap"), ADDRESS, Some(-50), false),
        }]
    );

    harness.manager.connect(ADDRESS).await.unwrap();
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Connecting)
    );
    harness.fake.events().on_connected(ADDRESS.to_string());
    let events = harness.drain().await;
    assert_eq!(
        events,
        vec![BleEvent::DeviceConnected {
            device: Device::new(Some("HR Strap"), ADDRESS, Some(-50), true),
        }]
    );
    assert!(harness.manager.devices().await.unwrap()[0].is_connected);

    harness.fake.clear_calls();
    let read = harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await;
    assert_eq!(
        read,
        Err(BleError::CharacteristicNotFound {
            service: uuid(HEART_RATE),
            characteristic: uuid(HEART_RATE_MEASUREMENT),
        })
    );
    assert!(harness.fake.calls().is_empty());
    assert_eq!(error_messages(&harness.drain().await).len(), 1);

    harness.manager.disconnect(ADDRESS).await.unwrap();
    assert_eq!(harness.fake.calls(), vec![Call::Disconnect(ADDRESS.to_string())]);
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnecting)
    );
    assert!(!harness.manager.devices().await.unwrap()[0].is_connected);

    harness.fake.events().on_disconnected(ADDRESS.to_string());
    assert_eq!(
        harness.drain().await,
        vec![BleEvent::DeviceDisconnected {
            device: Device::new(Some("HR Strap"), ADDRESS, Some(-50), false),
        }]
    );
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn overlapping_reads_yield_one_result() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    let request = harness.fake.last_request();
    let second = harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await;
    assert_eq!(
        second,
        Err(BleError::OperationInProgress {
            address: ADDRESS.to_string(),
            characteristic: uuid(HEART_RATE_MEASUREMENT),
            kind: OperationKind::Read,
        })
    );
    assert_eq!(
        harness.fake.calls(),
        vec![Call::Read(ADDRESS.to_string(), uuid(HEART_RATE_MEASUREMENT))]
    );

    // A read of another characteristic is independent.
    harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, BODY_SENSOR_LOCATION)
        .await
        .unwrap();

    let events = harness.fake.events();
    for _ in 0..2 {
        events.on_read_result(
            ADDRESS.to_string(),
            uuid(HEART_RATE),
            uuid(HEART_RATE_MEASUREMENT),
            request,
            Ok(vec![0x00, 0x48]),
        );
    }

    let delivered = harness.drain().await;
    let reads: Vec<_> = delivered
        .iter()
        .filter(|event| matches!(event, BleEvent::CharacteristicRead { .. }))
        .collect();
    assert_eq!(reads.len(), 1);
    assert!(matches!(
        reads[0],
        BleEvent::CharacteristicRead { value, .. } if value == &vec![0x00, 0x48]
    ));
    assert!(matches!(delivered[0], BleEvent::Error { .. }));
}

#[tokio::test]
async fn spontaneous_disconnect_is_reported_once() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    let events = harness.fake.events();
    events.on_disconnected(ADDRESS.to_string());
    events.on_disconnected(ADDRESS.to_string());

    let delivered = harness.drain().await;
    assert_eq!(delivered.len(), 1);
    assert!(matches!(
        &delivered[0],
        BleEvent::DeviceDisconnected { device } if !device.is_connected
    ));

    let read = harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await;
    assert_eq!(read, Err(BleError::NotConnected(ADDRESS.to_string())));
}

#[tokio::test]
async fn repeated_connect_and_disconnect_are_noops() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, None, None).await;
    harness.drain().await;
    harness.fake.clear_calls();

    harness.manager.disconnect(ADDRESS).await.unwrap();
    assert!(harness.fake.calls().is_empty());
    assert!(harness.drain().await.is_empty());

    harness.connected(ADDRESS).await;
    harness.manager.connect(ADDRESS).await.unwrap();
    assert!(harness.fake.calls().is_empty());
    assert!(harness.drain().await.is_empty());
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn connect_while_disconnecting_is_invalid() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;
    harness.manager.disconnect(ADDRESS).await.unwrap();

    let result = harness.manager.connect(ADDRESS).await;
    assert_eq!(
        result,
        Err(BleError::InvalidState {
            address: ADDRESS.to_string(),
            state: ConnectionState::Disconnecting,
        })
    );
}

#[tokio::test]
async fn rediscovery_only_reports_changes() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, Some("HR Strap"), Some(-60)).await;
    assert_eq!(harness.drain().await.len(), 1);

    let events = harness.fake.events();
    events.on_discovered(ADDRESS.to_string(), Some("HR Strap".to_string()), Some(-60));
    events.on_discovered(ADDRESS.to_string(), None, None);
    assert!(harness.drain().await.is_empty());

    events.on_discovered(ADDRESS.to_string(), None, Some(-55));
    assert_eq!(
        harness.drain().await,
        vec![BleEvent::DeviceFound {
            device: Device::new(Some("HR Strap"), ADDRESS, Some(-55), false),
        }]
    );
    assert_eq!(harness.manager.devices().await.unwrap().len(), 1);
}

#[tokio::test]
async fn new_scan_tears_down_session() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    harness.manager.start_scan().await.unwrap();
    assert_eq!(
        harness.fake.calls(),
        vec![
            Call::StopScan,
            Call::Disconnect(ADDRESS.to_string()),
            Call::StartScan
        ]
    );
    let delivered = harness.drain().await;
    assert!(matches!(
        delivered.as_slice(),
        [BleEvent::DeviceDisconnected { device }] if device.address == ADDRESS
    ));

    assert!(harness.manager.devices().await.unwrap().is_empty());
    assert_eq!(
        harness.manager.connect(ADDRESS).await,
        Err(BleError::DeviceNotFound(ADDRESS.to_string()))
    );

    // The same peripheral is reported afresh in the new session.
    harness
        .fake
        .events()
        .on_discovered(ADDRESS.to_string(), Some("HR Strap".to_string()), Some(-60));
    assert!(matches!(
        harness.drain().await.as_slice(),
        [.., BleEvent::DeviceFound { device }] if !device.is_connected
    ));
}

#[tokio::test]
async fn discovery_outside_scan_is_dropped() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, None, None).await;
    harness.manager.stop_scan().await.unwrap();
    harness.drain().await;

    harness
        .fake
        .events()
        .on_discovered("CC:DD".to_string(), None, None);
    assert!(harness.drain().await.is_empty());
    assert_eq!(
        harness.manager.connect("CC:DD").await,
        Err(BleError::DeviceNotFound("CC:DD".to_string()))
    );
    // Devices found before the stop remain addressable.
    assert_eq!(harness.manager.devices().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_returns_to_disconnected() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, None, None).await;
    harness.manager.connect(ADDRESS).await.unwrap();
    harness.drain().await;
    harness.fake.clear_calls();

    tokio::time::sleep(Duration::from_millis(1_001)).await;

    let errors = error_messages(&harness.drain().await);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Timed out"));
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );
    assert_eq!(harness.fake.calls(), vec![Call::Disconnect(ADDRESS.to_string())]);

    // A connection the stack completes afterwards is released silently.
    harness.fake.events().on_connected(ADDRESS.to_string());
    assert!(harness.drain().await.is_empty());
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );
    assert_eq!(harness.fake.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn connection_confirmed_in_time_is_not_expired() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(harness.drain().await.is_empty());
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Connected)
    );
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_disconnect_is_forced() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;
    harness.manager.disconnect(ADDRESS).await.unwrap();
    assert!(harness.drain().await.is_empty());

    tokio::time::sleep(Duration::from_millis(1_001)).await;

    assert!(matches!(
        harness.drain().await.as_slice(),
        [BleEvent::DeviceDisconnected { .. }]
    ));
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );

    // The late ack changes nothing.
    harness.fake.events().on_disconnected(ADDRESS.to_string());
    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn failed_connect_reports_error() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, None, None).await;
    harness.manager.connect(ADDRESS).await.unwrap();
    harness.drain().await;

    harness
        .fake
        .events()
        .on_connect_failed(ADDRESS.to_string(), "peer rejected");

    let errors = error_messages(&harness.drain().await);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("peer rejected"));
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn connect_that_cannot_be_issued_leaves_device_disconnected() {
    let mut harness = Harness::new().await;
    harness.discover(ADDRESS, None, None).await;
    harness.fake.refuse_requests(true);

    let result = harness.manager.connect(ADDRESS).await;

    assert!(matches!(result, Err(BleError::NativeFailure(_))));
    assert_eq!(error_messages(&harness.drain().await).len(), 1);
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn write_failure_reports_error_only() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    harness
        .manager
        .write_characteristic(ADDRESS, HEART_RATE, BODY_SENSOR_LOCATION, vec![0x01])
        .await
        .unwrap();
    assert_eq!(
        harness.fake.calls(),
        vec![Call::Write(
            ADDRESS.to_string(),
            uuid(BODY_SENSOR_LOCATION),
            vec![0x01]
        )]
    );
    harness.fake.events().on_write_result(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(BODY_SENSOR_LOCATION),
        harness.fake.last_request(),
        Err("write not permitted".to_string()),
    );

    let delivered = harness.drain().await;
    assert_eq!(delivered.len(), 1);
    assert!(error_messages(&delivered)[0].contains("write not permitted"));

    // The failed write no longer blocks the characteristic.
    harness
        .manager
        .write_characteristic(ADDRESS, HEART_RATE, BODY_SENSOR_LOCATION, vec![0x02])
        .await
        .unwrap();
    harness.fake.events().on_write_result(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(BODY_SENSOR_LOCATION),
        harness.fake.last_request(),
        Ok(()),
    );
    assert!(matches!(
        harness.drain().await.as_slice(),
        [BleEvent::CharacteristicWrite { characteristic, .. }]
            if *characteristic == uuid(BODY_SENSOR_LOCATION)
    ));
}

#[tokio::test]
async fn completion_after_disconnect_is_dropped() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;
    harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await
        .unwrap();

    let request = harness.fake.last_request();

    harness.manager.disconnect(ADDRESS).await.unwrap();
    let events = harness.fake.events();
    events.on_disconnected(ADDRESS.to_string());
    events.on_read_result(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(HEART_RATE_MEASUREMENT),
        request,
        Ok(vec![0x10]),
    );
    events.on_characteristic_changed(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(HEART_RATE_MEASUREMENT),
        vec![0x11],
    );

    assert!(matches!(
        harness.drain().await.as_slice(),
        [BleEvent::DeviceDisconnected { .. }]
    ));
}

#[tokio::test]
async fn notifications_surface_as_reads() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    harness
        .manager
        .notify_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT, true)
        .await
        .unwrap();
    assert_eq!(
        harness.fake.calls(),
        vec![Call::Notify(
            ADDRESS.to_string(),
            uuid(HEART_RATE_MEASUREMENT),
            true
        )]
    );

    let events = harness.fake.events();
    events.on_notify_result(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(HEART_RATE_MEASUREMENT),
        true,
        harness.fake.last_request(),
        Ok(()),
    );
    events.on_characteristic_changed(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(HEART_RATE_MEASUREMENT),
        vec![0x00, 0x50],
    );

    assert_eq!(
        harness.drain().await,
        vec![BleEvent::CharacteristicRead {
            device: Device::new(Some("HR Strap"), ADDRESS, Some(-60), true),
            service: uuid(HEART_RATE),
            characteristic: uuid(HEART_RATE_MEASUREMENT),
            value: vec![0x00, 0x50],
        }]
    );

    harness
        .manager
        .notify_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT, false)
        .await
        .unwrap();
    harness.fake.events().on_notify_result(
        ADDRESS.to_string(),
        uuid(HEART_RATE),
        uuid(HEART_RATE_MEASUREMENT),
        false,
        harness.fake.last_request(),
        Err("not supported".to_string()),
    );
    assert_eq!(error_messages(&harness.drain().await).len(), 1);
}

#[tokio::test]
async fn malformed_uuid_is_invalid_argument() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    let result = harness
        .manager
        .read_characteristic(ADDRESS, "heart-rate", HEART_RATE_MEASUREMENT)
        .await;

    assert!(matches!(result, Err(BleError::InvalidArgument(_))));
    assert!(harness.fake.calls().is_empty());
    assert_eq!(error_messages(&harness.drain().await).len(), 1);
}

#[tokio::test]
async fn unregistered_callback_drops_events() {
    let mut harness = Harness::new().await;
    harness.manager.set_callback(None).await.unwrap();
    harness.discover(ADDRESS, None, Some(-70)).await;
    assert!(harness.drain().await.is_empty());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    harness
        .manager
        .set_callback(Some(Box::new(move |event: BleEvent| {
            sink_seen.lock().unwrap().push(event)
        })))
        .await
        .unwrap();
    harness
        .fake
        .events()
        .on_discovered(ADDRESS.to_string(), None, Some(-65));
    harness.settle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![BleEvent::DeviceFound {
            device: Device::new(None, ADDRESS, Some(-65), false),
        }]
    );
}

#[tokio::test]
async fn scan_failure_is_reported() {
    let mut harness = Harness::new().await;
    harness.manager.start_scan().await.unwrap();
    harness.fake.events().on_scan_failed("adapter powered off");

    let errors = error_messages(&harness.drain().await);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("adapter powered off"));
}

#[tokio::test]
async fn shutdown_disconnects_and_stops() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    harness.manager.shutdown().await.unwrap();

    let mut delivered = Vec::new();
    while let Some(event) = harness.events.recv().await {
        delivered.push(event);
    }
    assert!(matches!(
        delivered.as_slice(),
        [BleEvent::DeviceDisconnected { .. }]
    ));
    assert!(harness.fake.calls().contains(&Call::Disconnect(ADDRESS.to_string())));
    assert_eq!(
        harness.manager.start_scan().await,
        Err(BleError::ManagerStopped)
    );
}

#[tokio::test]
async fn result_from_torn_down_link_is_not_taken_for_a_new_read() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;
    harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    let stale = harness.fake.last_request();

    harness.manager.disconnect(ADDRESS).await.unwrap();
    harness.fake.events().on_disconnected(ADDRESS.to_string());
    harness.manager.connect(ADDRESS).await.unwrap();
    let events = harness.fake.events();
    events.on_connected(ADDRESS.to_string());
    events.on_services_discovered(ADDRESS.to_string(), heart_rate_services());
    harness.drain().await;

    harness
        .manager
        .read_characteristic(ADDRESS, HEART_RATE, HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    let current = harness.fake.last_request();
    assert_ne!(stale, current);

    let events = harness.fake.events();
    for (request, value) in [(stale, 0xAA), (current, 0xBB)] {
        events.on_read_result(
            ADDRESS.to_string(),
            uuid(HEART_RATE),
            uuid(HEART_RATE_MEASUREMENT),
            request,
            Ok(vec![value]),
        );
    }

    let values: Vec<Vec<u8>> = harness
        .drain()
        .await
        .into_iter()
        .filter_map(|event| match event {
            BleEvent::CharacteristicRead { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![vec![0xBB]]);
}

#[tokio::test]
async fn released_link_ack_does_not_abort_new_connection() {
    let mut harness = Harness::new().await;
    harness.connected(ADDRESS).await;

    // The new session releases the live link; its ack arrives late.
    harness.discover(ADDRESS, Some("HR Strap"), Some(-60)).await;
    assert!(harness.fake.calls().contains(&Call::Disconnect(ADDRESS.to_string())));
    harness.manager.connect(ADDRESS).await.unwrap();
    harness.drain().await;

    let events = harness.fake.events();
    events.on_disconnected(ADDRESS.to_string());
    assert!(harness.drain().await.is_empty());
    assert_eq!(
        harness.manager.connection_state(ADDRESS).await,
        Ok(ConnectionState::Connecting)
    );

    events.on_connected(ADDRESS.to_string());
    assert!(matches!(
        harness.drain().await.as_slice(),
        [BleEvent::DeviceConnected { device }] if device.is_connected
    ));

    // Only the owed ack is absorbed; a real link loss is still reported.
    events.on_disconnected(ADDRESS.to_string());
    assert!(matches!(
        harness.drain().await.as_slice(),
        [BleEvent::DeviceDisconnected { .. }]
    ));
}
