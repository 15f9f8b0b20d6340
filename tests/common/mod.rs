//! Shared test harness: a recording mock adapter plus helpers to drive the
//! session loop deterministically under paused time.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use ble_bridge::adapter::{AdapterEvent, ConnectOptions, HostAdapter, WriteMode};
use ble_bridge::error::Result;
use ble_bridge::events::BridgeEvent;
use ble_bridge::session::{BleHandle, spawn};
use ble_bridge::types::{
    CharacteristicInfo, CharacteristicProps, PermissionState, PowerState, ServiceInfo,
};

/// A request the session issued against the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    RequestPermission,
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String, Vec<Uuid>),
    DiscoverCharacteristics(String, Uuid),
    Write(String, Uuid, Vec<u8>, WriteMode),
    SetNotify(String, Uuid, bool),
}

/// Mock adapter that records every request and lets tests inject events.
pub struct MockAdapter {
    pub power: Mutex<PowerState>,
    pub permission: Mutex<PermissionState>,
    pub calls: Mutex<Vec<Call>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            power: Mutex::new(PowerState::PoweredOn),
            permission: Mutex::new(PermissionState::Authorized),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_power(&self, power: PowerState) {
        *self.power.lock().unwrap() = power;
    }

    pub fn set_permission(&self, permission: PermissionState) {
        *self.permission.lock().unwrap() = permission;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl HostAdapter for MockAdapter {
    fn power_state(&self) -> PowerState {
        *self.power.lock().unwrap()
    }

    fn permission(&self) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self) -> Result<()> {
        self.record(Call::RequestPermission);
        Ok(())
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
        self.record(Call::StartScan(service_filter.to_vec()));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect_device(&self, device_id: &str, _options: ConnectOptions) -> Result<()> {
        self.record(Call::Connect(device_id.to_string()));
        Ok(())
    }

    async fn disconnect_device(&self, device_id: &str) -> Result<()> {
        self.record(Call::Disconnect(device_id.to_string()));
        Ok(())
    }

    async fn discover_services(&self, device_id: &str, service_filter: &[Uuid]) -> Result<()> {
        self.record(Call::DiscoverServices(
            device_id.to_string(),
            service_filter.to_vec(),
        ));
        Ok(())
    }

    async fn discover_characteristics(&self, device_id: &str, service_id: Uuid) -> Result<()> {
        self.record(Call::DiscoverCharacteristics(device_id.to_string(), service_id));
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        characteristic_id: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.record(Call::Write(
            device_id.to_string(),
            characteristic_id,
            value.to_vec(),
            mode,
        ));
        Ok(())
    }

    async fn set_notify(
        &self,
        device_id: &str,
        characteristic_id: Uuid,
        enable: bool,
    ) -> Result<()> {
        self.record(Call::SetNotify(device_id.to_string(), characteristic_id, enable));
        Ok(())
    }
}

pub struct Harness {
    pub adapter: Arc<MockAdapter>,
    pub handle: BleHandle,
    pub events: mpsc::UnboundedSender<AdapterEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = Arc::new(MockAdapter::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn(adapter.clone(), rx);
        Self { adapter, handle, events: tx }
    }

    pub fn inject(&self, event: AdapterEvent) {
        self.events.send(event).expect("session loop alive");
    }

    /// Initializes the adapter and makes one named device known via a scan.
    pub async fn with_device(&self, device_id: &str, name: &str) {
        self.handle.init_adapter().await.expect("init");
        self.handle.start_scan(Vec::new(), None).await.expect("scan");
        self.inject(AdapterEvent::DeviceDiscovered {
            device_id: device_id.to_string(),
            local_name: Some(name.to_string()),
            name: None,
            rssi: -50,
        });
        settle().await;
        self.handle.stop_scan().await.expect("stop scan");
    }

    /// Connects a known device by completing the connect with an injected
    /// event.
    pub async fn connect(&self, device_id: &str) {
        let handle = self.handle.clone();
        let id = device_id.to_string();
        let task = tokio::spawn(async move { handle.connect(&id).await });
        settle().await;
        self.inject(AdapterEvent::Connected { device_id: device_id.to_string() });
        task.await.expect("join").expect("connect");
    }

    /// Populates the GATT cache with one service and its characteristics.
    pub async fn discover_gatt(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    ) {
        let handle = self.handle.clone();
        let id = device_id.to_string();
        let task = tokio::spawn(async move { handle.get_services(&id).await });
        settle().await;
        self.inject(AdapterEvent::ServicesDiscovered {
            device_id: device_id.to_string(),
            result: Ok(vec![ServiceInfo { service_id, is_primary: true }]),
        });
        task.await.expect("join").expect("services");
        self.inject(AdapterEvent::CharacteristicsDiscovered {
            device_id: device_id.to_string(),
            service_id,
            result: Ok(characteristics),
        });
        settle().await;
    }
}

/// Lets the session loop drain its channels. Under paused time the sleep
/// auto-advances, so this is effectively a scheduler yield.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Receives the next bridge event, failing the test after a virtual second.
pub async fn next_event(rx: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no bridge event within a second")
        .expect("event channel open")
}

pub fn writable_char(service_id: Uuid, characteristic_id: Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        service_id,
        characteristic_id,
        properties: CharacteristicProps { write: true, notify: true, ..Default::default() },
        is_notifying: false,
    }
}
