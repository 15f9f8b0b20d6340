//! End-to-end session behavior against a mock adapter: lifecycle, scanning,
//! the single-connection rule, GATT flows and the reconnection policy.

mod common;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use ble_bridge::adapter::{AdapterEvent, WriteMode};
use ble_bridge::error::BleError;
use ble_bridge::events::BridgeEvent;
use ble_bridge::types::{CharacteristicInfo, CharacteristicProps, PermissionState, PowerState};

use common::{Call, Harness, next_event, settle, writable_char};

const SERVICE: Uuid = Uuid::from_u128(0x1810);
const CHARACTERISTIC: Uuid = Uuid::from_u128(0x2a35);

#[tokio::test(start_paused = true)]
async fn init_reports_available_when_powered_on() {
    let h = Harness::new();
    let result = h.handle.init_adapter().await.unwrap();
    assert_eq!(result, json!({"available": true}));
    let state = h.handle.get_adapter_state().await.unwrap();
    assert_eq!(state["available"], true);
    assert_eq!(state["discovering"], false);
}

#[tokio::test(start_paused = true)]
async fn init_waits_for_a_definite_power_state() {
    let h = Harness::new();
    h.adapter.set_power(PowerState::Unknown);
    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.init_adapter().await });
    settle().await;
    h.inject(AdapterEvent::StateChanged { power: PowerState::PoweredOn });
    let result = task.await.unwrap().unwrap();
    assert_eq!(result["available"], true);
}

#[tokio::test(start_paused = true)]
async fn init_is_rejected_without_permission() {
    let h = Harness::new();
    h.adapter.set_permission(PermissionState::Denied);
    let err = h.handle.init_adapter().await.unwrap_err();
    assert_eq!(err, BleError::PermissionDenied);
}

#[tokio::test(start_paused = true)]
async fn operations_before_init_are_rejected() {
    let h = Harness::new();
    assert_eq!(
        h.handle.get_adapter_state().await.unwrap_err(),
        BleError::AdapterNotInitialized
    );
    assert_eq!(
        h.handle.start_scan(Vec::new(), None).await.unwrap_err(),
        BleError::AdapterNotInitialized
    );
}

#[tokio::test(start_paused = true)]
async fn scan_dedupes_devices_and_drops_nameless_ones() {
    let h = Harness::new();
    h.handle.init_adapter().await.unwrap();
    let mut events = h.handle.events();
    h.handle.start_scan(Vec::new(), None).await.unwrap();
    h.inject(AdapterEvent::DeviceDiscovered {
        device_id: "A".into(),
        local_name: Some("Sensor".into()),
        name: None,
        rssi: -60,
    });
    // Repeat sighting only refreshes the RSSI, nameless one is ignored.
    h.inject(AdapterEvent::DeviceDiscovered {
        device_id: "A".into(),
        local_name: Some("Sensor".into()),
        name: None,
        rssi: -41,
    });
    h.inject(AdapterEvent::DeviceDiscovered {
        device_id: "ghost".into(),
        local_name: None,
        name: None,
        rssi: -80,
    });
    settle().await;

    let snapshot = h.handle.stop_scan().await.unwrap();
    let devices = snapshot["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["deviceId"], "A");
    assert_eq!(devices[0]["rssi"], -41);

    match next_event(&mut events).await {
        BridgeEvent::DeviceFound { device_id, name, rssi } => {
            assert_eq!(device_id, "A");
            assert_eq!(name, "Sensor");
            assert_eq!(rssi, -60);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // Exactly one found event despite two sightings.
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn scan_timeout_stops_discovery() {
    let h = Harness::new();
    h.handle.init_adapter().await.unwrap();
    h.handle.start_scan(Vec::new(), Some(50)).await.unwrap();
    assert_eq!(h.handle.get_adapter_state().await.unwrap()["discovering"], true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.get_adapter_state().await.unwrap()["discovering"], false);
    assert_eq!(h.adapter.count(|c| *c == Call::StopScan), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_resolves_with_device_details() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.connect("A").await });
    settle().await;
    h.inject(AdapterEvent::Connected { device_id: "A".into() });
    let result = task.await.unwrap().unwrap();
    assert_eq!(result["deviceId"], "A");
    assert_eq!(result["name"], "Sensor");
}

#[tokio::test(start_paused = true)]
async fn connect_to_unknown_device_fails() {
    let h = Harness::new();
    h.handle.init_adapter().await.unwrap();
    assert!(matches!(
        h.handle.connect("nope").await.unwrap_err(),
        BleError::DeviceNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_stops_a_running_scan_first() {
    let h = Harness::new();
    h.handle.init_adapter().await.unwrap();
    h.handle.start_scan(Vec::new(), None).await.unwrap();
    h.inject(AdapterEvent::DeviceDiscovered {
        device_id: "A".into(),
        local_name: Some("Sensor".into()),
        name: None,
        rssi: -50,
    });
    settle().await;
    h.connect("A").await;
    let calls = h.adapter.calls();
    let stop = calls.iter().position(|c| *c == Call::StopScan).unwrap();
    let connect = calls.iter().position(|c| *c == Call::Connect("A".into())).unwrap();
    assert!(stop < connect);
}

#[tokio::test(start_paused = true)]
async fn connecting_again_to_the_connected_device_is_a_no_op() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    // Resolves without another stack request.
    let result = h.handle.connect("A").await.unwrap();
    assert_eq!(result["deviceId"], "A");
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 1);
}

#[tokio::test(start_paused = true)]
async fn connecting_elsewhere_tears_down_the_current_link() {
    let h = Harness::new();
    h.handle.init_adapter().await.unwrap();
    h.handle.start_scan(Vec::new(), None).await.unwrap();
    for (id, name) in [("A", "Sensor"), ("B", "Other")] {
        h.inject(AdapterEvent::DeviceDiscovered {
            device_id: id.into(),
            local_name: Some(name.into()),
            name: None,
            rssi: -70,
        });
    }
    settle().await;
    h.handle.stop_scan().await.unwrap();
    h.connect("A").await;

    h.connect("B").await;
    let calls = h.adapter.calls();
    let teardown = calls.iter().position(|c| *c == Call::Disconnect("A".into())).unwrap();
    let connect_b = calls.iter().position(|c| *c == Call::Connect("B".into())).unwrap();
    assert!(teardown < connect_b);
}

#[tokio::test(start_paused = true)]
async fn requested_disconnect_does_not_trigger_reconnection() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let mut events = h.handle.events();

    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.disconnect("A").await });
    settle().await;
    // Even an error on a requested disconnect is not "unexpected".
    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("terminated by local host".into()),
    });
    let result = task.await.unwrap().unwrap();
    assert_eq!(result["deviceId"], "A");

    match next_event(&mut events).await {
        BridgeEvent::ConnectionStateChange { is_connected, unexpected, .. } => {
            assert!(!is_connected);
            assert_eq!(unexpected, Some(false));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // No reconnection attempt, even after the backoff window.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 1);
}

#[tokio::test(start_paused = true)]
async fn unexpected_disconnect_reconnects_with_backoff() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let mut events = h.handle.events();

    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("link supervision timeout".into()),
    });
    settle().await;
    match next_event(&mut events).await {
        BridgeEvent::ConnectionStateChange { is_connected, unexpected, .. } => {
            assert!(!is_connected);
            assert_eq!(unexpected, Some(true));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // First attempt fires after the initial two second delay.
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 1);
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 2);

    h.inject(AdapterEvent::Connected { device_id: "A".into() });
    match next_event(&mut events).await {
        BridgeEvent::ConnectionStateChange { is_connected, is_reconnection, attempt, .. } => {
            assert!(is_connected);
            assert_eq!(is_reconnection, Some(true));
            assert_eq!(attempt, Some(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnection_succeeds_on_a_later_attempt() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let mut events = h.handle.events();

    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("connection lost".into()),
    });
    settle().await;
    // Drop the disconnect notification.
    let _ = next_event(&mut events).await;

    // First attempt fires after 2s and fails.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 2);
    h.inject(AdapterEvent::ConnectFailed {
        device_id: "A".into(),
        reason: "still gone".into(),
    });
    settle().await;

    // Second attempt fires after the grown 3s delay and succeeds.
    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 3);
    h.inject(AdapterEvent::Connected { device_id: "A".into() });
    match next_event(&mut events).await {
        BridgeEvent::ConnectionStateChange { is_connected, is_reconnection, attempt, .. } => {
            assert!(is_connected);
            assert_eq!(is_reconnection, Some(true));
            assert_eq!(attempt, Some(2));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Success clears the policy, no further attempts fire.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnection_gives_up_after_three_attempts() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let mut events = h.handle.events();

    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("connection lost".into()),
    });
    settle().await;
    // Drop the disconnect notification.
    let _ = next_event(&mut events).await;

    // Backoff schedule: 2s, 3s, 4.5s. Every attempt fails.
    for (wait_ms, expected_attempts) in [(2100u64, 2usize), (3100, 3), (4600, 4)] {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        assert_eq!(
            h.adapter.count(|c| *c == Call::Connect("A".into())),
            expected_attempts
        );
        h.inject(AdapterEvent::ConnectFailed {
            device_id: "A".into(),
            reason: "still gone".into(),
        });
        settle().await;
    }

    match next_event(&mut events).await {
        BridgeEvent::ConnectionStateChange { reconnection_failed, reason, .. } => {
            assert_eq!(reconnection_failed, Some(true));
            assert!(reason.unwrap().contains("max reconnection attempts"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // Policy is exhausted, nothing further is scheduled.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 4);
}

#[tokio::test(start_paused = true)]
async fn cancelling_reconnection_stops_the_scheduled_attempt() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;

    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("connection lost".into()),
    });
    settle().await;
    h.handle.cancel_reconnection("A").await.unwrap();
    // Idempotent.
    h.handle.cancel_all_reconnections().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 1);
}

#[tokio::test(start_paused = true)]
async fn characteristics_are_aggregated_across_services() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;

    let second_service = Uuid::from_u128(0x180f);
    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.get_services("A").await });
    settle().await;
    h.inject(AdapterEvent::ServicesDiscovered {
        device_id: "A".into(),
        result: Ok(vec![
            ble_bridge::types::ServiceInfo { service_id: SERVICE, is_primary: true },
            ble_bridge::types::ServiceInfo { service_id: second_service, is_primary: true },
        ]),
    });
    let services = task.await.unwrap().unwrap();
    assert_eq!(services["services"].as_array().unwrap().len(), 2);
    // Discovery is fanned out per service.
    assert_eq!(
        h.adapter.count(|c| matches!(c, Call::DiscoverCharacteristics(d, _) if d == "A")),
        2
    );

    // Cache the second service's characteristics first.
    h.inject(AdapterEvent::CharacteristicsDiscovered {
        device_id: "A".into(),
        service_id: second_service,
        result: Ok(vec![writable_char(second_service, Uuid::from_u128(0x2a19))]),
    });
    settle().await;

    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.get_characteristics("A", SERVICE).await });
    settle().await;
    h.inject(AdapterEvent::CharacteristicsDiscovered {
        device_id: "A".into(),
        service_id: SERVICE,
        result: Ok(vec![writable_char(SERVICE, CHARACTERISTIC)]),
    });
    let result = task.await.unwrap().unwrap();
    // One reply with the union over both services.
    assert_eq!(result["characteristics"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn gatt_operations_require_a_connected_device() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    assert!(matches!(
        h.handle.get_services("A").await.unwrap_err(),
        BleError::DeviceNotFound(_)
    ));
    assert!(matches!(
        h.handle
            .write_characteristic("A", SERVICE, CHARACTERISTIC, "01", Some("hex"))
            .await
            .unwrap_err(),
        BleError::DeviceNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn write_with_response_echoes_the_payload_in_hex() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    h.discover_gatt("A", SERVICE, vec![writable_char(SERVICE, CHARACTERISTIC)])
        .await;

    let handle = h.handle.clone();
    let task = tokio::spawn(async move {
        handle
            .write_characteristic("A", SERVICE, CHARACTERISTIC, "01ff", Some("hex"))
            .await
    });
    settle().await;

    // A second write before the confirmation is rejected.
    assert!(matches!(
        h.handle
            .write_characteristic("A", SERVICE, CHARACTERISTIC, "02", Some("hex"))
            .await
            .unwrap_err(),
        BleError::WriteInProgress(_)
    ));

    h.inject(AdapterEvent::ValueWritten {
        device_id: "A".into(),
        characteristic_id: CHARACTERISTIC,
        error: None,
    });
    let result = task.await.unwrap().unwrap();
    assert_eq!(result["value"], "01ff");
    assert_eq!(
        h.adapter.count(|c| matches!(c, Call::Write(_, _, v, WriteMode::WithResponse) if v == &[0x01, 0xff])),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn write_is_checked_against_characteristic_properties() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let read_only = CharacteristicInfo {
        service_id: SERVICE,
        characteristic_id: CHARACTERISTIC,
        properties: CharacteristicProps { read: true, ..Default::default() },
        is_notifying: false,
    };
    h.discover_gatt("A", SERVICE, vec![read_only]).await;

    assert_eq!(
        h.handle
            .write_characteristic("A", SERVICE, CHARACTERISTIC, "01", Some("hex"))
            .await
            .unwrap_err(),
        BleError::WriteNotSupported
    );
    // Rejected locally, never reaches the stack.
    assert_eq!(h.adapter.count(|c| matches!(c, Call::Write(..))), 0);

    assert!(matches!(
        h.handle
            .write_characteristic("A", SERVICE, Uuid::from_u128(0xdead), "01", Some("hex"))
            .await
            .unwrap_err(),
        BleError::CharacteristicNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn without_response_writes_resolve_immediately() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let wwr = CharacteristicInfo {
        service_id: SERVICE,
        characteristic_id: CHARACTERISTIC,
        properties: CharacteristicProps { write_without_response: true, ..Default::default() },
        is_notifying: false,
    };
    h.discover_gatt("A", SERVICE, vec![wwr]).await;

    // No confirmation event needed.
    let result = h
        .handle
        .write_characteristic("A", SERVICE, CHARACTERISTIC, "abcd", Some("hex"))
        .await
        .unwrap();
    assert_eq!(result["value"], "abcd");
    assert_eq!(
        h.adapter
            .count(|c| matches!(c, Call::Write(_, _, _, WriteMode::WithoutResponse))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn notify_subscription_and_value_stream() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    h.discover_gatt("A", SERVICE, vec![writable_char(SERVICE, CHARACTERISTIC)])
        .await;
    let mut events = h.handle.events();

    let handle = h.handle.clone();
    let task =
        tokio::spawn(async move { handle.set_notify("A", SERVICE, CHARACTERISTIC, true).await });
    settle().await;
    h.inject(AdapterEvent::NotifyStateChanged {
        device_id: "A".into(),
        characteristic_id: CHARACTERISTIC,
        is_notifying: true,
        error: None,
    });
    let result = task.await.unwrap().unwrap();
    assert_eq!(result["isNotifying"], true);
    match next_event(&mut events).await {
        BridgeEvent::NotificationStateChange { is_notifying, .. } => assert!(is_notifying),
        other => panic!("unexpected event: {other:?}"),
    }

    h.inject(AdapterEvent::ValueUpdated {
        device_id: "A".into(),
        characteristic_id: CHARACTERISTIC,
        value: vec![0xde, 0xad],
    });
    match next_event(&mut events).await {
        BridgeEvent::CharacteristicValueChange { value, .. } => assert_eq!(value, "dead"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn notify_requires_the_notify_property() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;
    let write_only = CharacteristicInfo {
        service_id: SERVICE,
        characteristic_id: CHARACTERISTIC,
        properties: CharacteristicProps { write: true, ..Default::default() },
        is_notifying: false,
    };
    h.discover_gatt("A", SERVICE, vec![write_only]).await;

    assert!(matches!(
        h.handle
            .set_notify("A", SERVICE, CHARACTERISTIC, true)
            .await
            .unwrap_err(),
        BleError::OperationNotSupported(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn power_loss_fails_pending_operations() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;

    let handle = h.handle.clone();
    let task = tokio::spawn(async move { handle.get_services("A").await });
    settle().await;

    h.adapter.set_power(PowerState::PoweredOff);
    h.inject(AdapterEvent::StateChanged { power: PowerState::PoweredOff });
    assert!(matches!(
        task.await.unwrap().unwrap_err(),
        BleError::AdapterNotReady(_)
    ));
    assert!(matches!(
        h.handle.start_scan(Vec::new(), None).await.unwrap_err(),
        BleError::AdapterNotReady(_)
    ));
    // Back on, the session keeps working.
    h.adapter.set_power(PowerState::PoweredOn);
    h.inject(AdapterEvent::StateChanged { power: PowerState::PoweredOn });
    settle().await;
    h.handle.start_scan(Vec::new(), None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_resets_the_whole_session() {
    let h = Harness::new();
    h.with_device("A", "Sensor").await;
    h.connect("A").await;

    h.handle.close_adapter().await.unwrap();
    assert_eq!(h.adapter.count(|c| *c == Call::Disconnect("A".into())), 1);
    assert_eq!(
        h.handle.get_adapter_state().await.unwrap_err(),
        BleError::AdapterNotInitialized
    );

    // The stack's late disconnect report after close must not start
    // reconnection.
    h.inject(AdapterEvent::Disconnected {
        device_id: "A".into(),
        error: Some("terminated by local host".into()),
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.adapter.count(|c| *c == Call::Connect("A".into())), 1);

    // Reinitializing starts from an empty registry.
    h.handle.init_adapter().await.unwrap();
    let devices = h.handle.get_discovered_devices().await.unwrap();
    assert_eq!(devices["devices"].as_array().unwrap().len(), 0);
}
