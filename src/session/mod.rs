//! Bluetooth session core.
//!
//! All mutable session state lives in one task that owns the event loop:
//! bridge operations arrive on an ops channel, hardware completions arrive
//! on the adapter-event channel, and scheduled work (scan timeouts,
//! reconnection attempts) arrives on an internal timer channel. Handlers
//! therefore never lock anything and every state transition is totally
//! ordered.

mod callbacks;
mod gatt;
mod reconnect;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, ConnectOptions, HostAdapter, WriteMode};
use crate::encoding::{ValueEncoding, decode_value, to_hex};
use crate::error::{BleError, Result};
use crate::events::BridgeEvent;
use crate::types::{ConnectionState, PermissionState, PowerState};

use callbacks::{CallbackKey, CallbackRegistry, OperationKind, Reply};
use gatt::GattCache;
use reconnect::ReconnectTracker;

/// Capacity of the bridge-event broadcast channel. Slow listeners that fall
/// further behind than this lose events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Operations accepted by the session loop. Each carries a oneshot reply
/// that is either answered inline or parked as a pending callback.
enum Op {
    InitAdapter { reply: Reply },
    RequestPermission { reply: Reply },
    CheckPermission { reply: Reply },
    StartScan { services: Vec<Uuid>, timeout_ms: Option<u64>, reply: Reply },
    StopScan { reply: Reply },
    Connect { device_id: String, reply: Reply },
    Disconnect { device_id: String, reply: Reply },
    GetServices { device_id: String, reply: Reply },
    GetCharacteristics { device_id: String, service_id: Uuid, reply: Reply },
    Write {
        device_id: String,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: Vec<u8>,
        reply: Reply,
    },
    SetNotify {
        device_id: String,
        service_id: Uuid,
        characteristic_id: Uuid,
        enable: bool,
        reply: Reply,
    },
    CloseAdapter { reply: Reply },
    GetAdapterState { reply: Reply },
    GetDiscoveredDevices { reply: Reply },
    CancelReconnection { device_id: String, reply: Reply },
    CancelAllReconnections { reply: Reply },
}

/// Internal timers routed back into the loop so their handlers run with
/// exclusive access to session state.
#[derive(Debug)]
enum TimerEvent {
    ScanTimeout,
    Reconnect { device_id: String, attempt: u32 },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct BleHandle {
    ops: mpsc::UnboundedSender<Op>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Starts the session loop on the current runtime and returns its handle.
/// The loop stops when the last handle is dropped or the adapter-event
/// channel closes.
pub fn spawn(
    adapter: Arc<dyn HostAdapter>,
    adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
) -> BleHandle {
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let session = BleSession {
        adapter,
        ops: ops_rx,
        adapter_events,
        timer_tx,
        timer_rx,
        events: events_tx.clone(),
        opened: false,
        power: PowerState::Unknown,
        scanning: false,
        scan_timer: None,
        registry: registry::DeviceRegistry::default(),
        callbacks: CallbackRegistry::default(),
        current: None,
        intentional_disconnect: false,
        reconnect: ReconnectTracker::default(),
        gatt: GattCache::default(),
    };
    tokio::spawn(session.run());
    BleHandle { ops: ops_tx, events: events_tx }
}

impl BleHandle {
    /// Subscribes to bridge push events. Each subscriber receives every
    /// event emitted while its receiver is alive.
    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Op) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(make(tx))
            .map_err(|_| BleError::Unknown("session closed".into()))?;
        rx.await
            .map_err(|_| BleError::Unknown("operation abandoned".into()))?
    }

    pub async fn init_adapter(&self) -> Result<Value> {
        self.request(|reply| Op::InitAdapter { reply }).await
    }

    pub async fn request_permission(&self) -> Result<Value> {
        self.request(|reply| Op::RequestPermission { reply }).await
    }

    pub async fn check_permission(&self) -> Result<Value> {
        self.request(|reply| Op::CheckPermission { reply }).await
    }

    /// Starts scanning, optionally filtered by service ids and bounded by a
    /// timeout after which the scan stops on its own.
    pub async fn start_scan(&self, services: Vec<Uuid>, timeout_ms: Option<u64>) -> Result<Value> {
        self.request(|reply| Op::StartScan { services, timeout_ms, reply })
            .await
    }

    /// Stops scanning and returns the devices discovered so far. Safe to
    /// call when no scan is running.
    pub async fn stop_scan(&self) -> Result<Value> {
        self.request(|reply| Op::StopScan { reply }).await
    }

    pub async fn connect(&self, device_id: &str) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::Connect { device_id, reply }).await
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::Disconnect { device_id, reply }).await
    }

    pub async fn get_services(&self, device_id: &str) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::GetServices { device_id, reply }).await
    }

    pub async fn get_characteristics(&self, device_id: &str, service_id: Uuid) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::GetCharacteristics { device_id, service_id, reply })
            .await
    }

    /// Decodes the value with the named encoding and writes it. Prefers a
    /// with-response write when the characteristic supports one.
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &str,
        encoding: Option<&str>,
    ) -> Result<Value> {
        let bytes = decode_value(value, ValueEncoding::parse(encoding))?;
        if bytes.is_empty() {
            return Err(BleError::InvalidParameter("value must not be empty".into()));
        }
        let device_id = device_id.to_string();
        self.request(|reply| Op::Write {
            device_id,
            service_id,
            characteristic_id,
            value: bytes,
            reply,
        })
        .await
    }

    pub async fn set_notify(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
        enable: bool,
    ) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::SetNotify {
            device_id,
            service_id,
            characteristic_id,
            enable,
            reply,
        })
        .await
    }

    pub async fn close_adapter(&self) -> Result<Value> {
        self.request(|reply| Op::CloseAdapter { reply }).await
    }

    pub async fn get_adapter_state(&self) -> Result<Value> {
        self.request(|reply| Op::GetAdapterState { reply }).await
    }

    pub async fn get_discovered_devices(&self) -> Result<Value> {
        self.request(|reply| Op::GetDiscoveredDevices { reply }).await
    }

    /// Stops any scheduled reconnection for the device. Idempotent.
    pub async fn cancel_reconnection(&self, device_id: &str) -> Result<Value> {
        let device_id = device_id.to_string();
        self.request(|reply| Op::CancelReconnection { device_id, reply })
            .await
    }

    pub async fn cancel_all_reconnections(&self) -> Result<Value> {
        self.request(|reply| Op::CancelAllReconnections { reply }).await
    }
}

struct BleSession {
    adapter: Arc<dyn HostAdapter>,
    ops: mpsc::UnboundedReceiver<Op>,
    adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    /// Kept alive so the timer channel never closes.
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    events: broadcast::Sender<BridgeEvent>,

    opened: bool,
    power: PowerState,
    scanning: bool,
    scan_timer: Option<CancellationToken>,
    registry: registry::DeviceRegistry,
    callbacks: CallbackRegistry,
    /// The single device the session considers connected or connecting.
    current: Option<String>,
    /// Set while a caller-requested disconnect is in flight, so its
    /// completion event is not mistaken for a link failure.
    intentional_disconnect: bool,
    reconnect: ReconnectTracker,
    gatt: GattCache,
}

impl BleSession {
    async fn run(mut self) {
        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => self.handle_op(op).await,
                    None => break,
                },
                event = self.adapter_events.recv() => match event {
                    Some(event) => self.handle_adapter_event(event).await,
                    None => break,
                },
                Some(timer) = self.timer_rx.recv() => {
                    self.handle_timer(timer).await;
                }
            }
        }
        debug!("bluetooth session loop stopped");
    }

    fn emit(&self, event: BridgeEvent) {
        // No listeners is fine, events are best-effort.
        let _ = self.events.send(event);
    }

    /// Operations that touch the radio require an initialized, authorized,
    /// powered-on adapter.
    fn guard_ready(&self) -> Result<()> {
        if !self.opened {
            return Err(BleError::AdapterNotInitialized);
        }
        match self.adapter.permission() {
            PermissionState::Authorized => {}
            PermissionState::NotDetermined => return Err(BleError::PermissionNotDetermined),
            _ => return Err(BleError::PermissionDenied),
        }
        if self.power != PowerState::PoweredOn {
            return Err(BleError::AdapterNotReady(self.power.to_string()));
        }
        Ok(())
    }

    /// GATT operations additionally require the target to be the currently
    /// connected device.
    fn guard_connected(&self, device_id: &str) -> Result<()> {
        self.guard_ready()?;
        let is_current = self.current.as_deref() == Some(device_id);
        if is_current && self.registry.state_of(device_id) == Some(ConnectionState::Connected) {
            Ok(())
        } else {
            Err(BleError::DeviceNotFound(format!("{device_id} is not connected")))
        }
    }

    /// Stops any running scan and returns a snapshot of discovered devices.
    async fn finish_scan(&mut self) -> Value {
        if let Some(timer) = self.scan_timer.take() {
            timer.cancel();
        }
        if self.scanning {
            self.scanning = false;
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("stop scan failed: {e}");
            }
        }
        json!({ "devices": self.registry.snapshot() })
    }

    /// Forgets connection-scoped state for one device.
    fn clean_device(&mut self, device_id: &str) {
        if self.current.as_deref() == Some(device_id) {
            self.current = None;
        }
        self.gatt.clear_device(device_id);
        self.registry.set_state(device_id, ConnectionState::Disconnected);
    }

    /// Schedules reconnection attempt `attempt`, or gives up and notifies
    /// listeners once the attempt limit is exceeded.
    fn schedule_reconnect(&mut self, device_id: &str, attempt: u32) {
        if attempt > reconnect::MAX_ATTEMPTS {
            self.give_up_reconnect(device_id, "max reconnection attempts reached");
            return;
        }
        let delay = reconnect::backoff_delay(attempt);
        info!(
            "scheduling reconnect attempt {attempt}/{} to {device_id} in {delay:?}",
            reconnect::MAX_ATTEMPTS
        );
        let token = CancellationToken::new();
        self.reconnect.arm_timer(device_id, token.clone());
        let tx = self.timer_tx.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(TimerEvent::Reconnect { device_id, attempt });
                }
            }
        });
    }

    fn give_up_reconnect(&mut self, device_id: &str, reason: &str) {
        warn!("giving up on reconnecting to {device_id}: {reason}");
        self.reconnect.cancel(device_id);
        let name = self.registry.name_of(device_id);
        self.emit(BridgeEvent::ConnectionStateChange {
            device_id: device_id.to_string(),
            name,
            is_connected: false,
            unexpected: None,
            is_reconnection: None,
            attempt: None,
            reconnection_failed: Some(true),
            reason: Some(reason.to_string()),
        });
    }

    async fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::ScanTimeout => {
                if self.scanning {
                    info!("scan timeout reached, stopping discovery");
                    self.finish_scan().await;
                }
            }
            TimerEvent::Reconnect { device_id, attempt } => {
                if !self.reconnect.is_tracking(&device_id) {
                    return;
                }
                if self.power != PowerState::PoweredOn {
                    self.give_up_reconnect(&device_id, "adapter powered off");
                    return;
                }
                if self.registry.state_of(&device_id) == Some(ConnectionState::Connected) {
                    self.reconnect.cancel(&device_id);
                    return;
                }
                info!("reconnect attempt {attempt} to {device_id}");
                self.reconnect.set_attempt(&device_id, attempt);
                self.registry.set_state(&device_id, ConnectionState::Connecting);
                if let Err(e) = self
                    .adapter
                    .connect_device(&device_id, ConnectOptions::default())
                    .await
                {
                    warn!("reconnect attempt {attempt} to {device_id} not issued: {e}");
                    self.schedule_reconnect(&device_id, attempt + 1);
                }
            }
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::InitAdapter { reply } => self.op_init_adapter(reply).await,
            Op::RequestPermission { reply } => self.op_request_permission(reply).await,
            Op::CheckPermission { reply } => {
                let p = self.adapter.permission();
                let _ = reply.send(Ok(json!({
                    "authorized": p == PermissionState::Authorized,
                    "denied": matches!(p, PermissionState::Denied | PermissionState::Restricted),
                    "notDetermined": p == PermissionState::NotDetermined,
                })));
            }
            Op::StartScan { services, timeout_ms, reply } => {
                self.op_start_scan(services, timeout_ms, reply).await;
            }
            Op::StopScan { reply } => {
                let snapshot = self.finish_scan().await;
                let _ = reply.send(Ok(snapshot));
            }
            Op::Connect { device_id, reply } => self.op_connect(device_id, reply).await,
            Op::Disconnect { device_id, reply } => self.op_disconnect(device_id, reply).await,
            Op::GetServices { device_id, reply } => self.op_get_services(device_id, reply).await,
            Op::GetCharacteristics { device_id, service_id, reply } => {
                self.op_get_characteristics(device_id, service_id, reply).await;
            }
            Op::Write { device_id, service_id, characteristic_id, value, reply } => {
                self.op_write(device_id, service_id, characteristic_id, value, reply)
                    .await;
            }
            Op::SetNotify { device_id, service_id, characteristic_id, enable, reply } => {
                self.op_set_notify(device_id, service_id, characteristic_id, enable, reply)
                    .await;
            }
            Op::CloseAdapter { reply } => self.op_close_adapter(reply).await,
            Op::GetAdapterState { reply } => {
                let result = if self.opened {
                    Ok(json!({
                        "available": self.power == PowerState::PoweredOn
                            && self.adapter.permission() == PermissionState::Authorized,
                        "discovering": self.scanning,
                    }))
                } else {
                    Err(BleError::AdapterNotInitialized)
                };
                let _ = reply.send(result);
            }
            Op::GetDiscoveredDevices { reply } => {
                let result = if !self.opened {
                    Err(BleError::AdapterNotInitialized)
                } else if self.power != PowerState::PoweredOn
                    || self.adapter.permission() != PermissionState::Authorized
                {
                    Err(BleError::AdapterNotReady(self.power.to_string()))
                } else {
                    Ok(json!({ "devices": self.registry.snapshot() }))
                };
                let _ = reply.send(result);
            }
            Op::CancelReconnection { device_id, reply } => {
                self.reconnect.cancel(&device_id);
                let _ = reply.send(Ok(json!({})));
            }
            Op::CancelAllReconnections { reply } => {
                self.reconnect.cancel_all();
                let _ = reply.send(Ok(json!({})));
            }
        }
    }

    async fn op_init_adapter(&mut self, reply: Reply) {
        match self.adapter.permission() {
            PermissionState::Denied | PermissionState::Restricted => {
                let _ = reply.send(Err(BleError::PermissionDenied));
            }
            PermissionState::Authorized => {
                self.opened = true;
                self.power = self.adapter.power_state();
                match self.power {
                    PowerState::PoweredOn => {
                        info!("adapter initialized, powered on");
                        let _ = reply.send(Ok(json!({ "available": true })));
                    }
                    PowerState::Unknown | PowerState::Resetting => {
                        // Park until the stack reports a definite state.
                        self.callbacks
                            .register(CallbackKey::global(OperationKind::Init), reply);
                    }
                    p => {
                        let _ = reply.send(Err(BleError::AdapterNotReady(p.to_string())));
                    }
                }
            }
            PermissionState::NotDetermined => {
                self.opened = true;
                self.power = self.adapter.power_state();
                let key = CallbackKey::global(OperationKind::Init);
                self.callbacks.register(key.clone(), reply);
                if let Err(e) = self.adapter.request_permission().await {
                    self.callbacks.resolve(&key, Err(e));
                }
            }
        }
    }

    async fn op_request_permission(&mut self, reply: Reply) {
        match self.adapter.permission() {
            PermissionState::Authorized => {
                let _ = reply.send(Ok(json!({ "authorized": true })));
            }
            PermissionState::Denied | PermissionState::Restricted => {
                let _ = reply.send(Err(BleError::PermissionDenied));
            }
            PermissionState::NotDetermined => {
                let key = CallbackKey::global(OperationKind::Init);
                self.callbacks.register(key.clone(), reply);
                if let Err(e) = self.adapter.request_permission().await {
                    self.callbacks.resolve(&key, Err(e));
                }
            }
        }
    }

    async fn op_start_scan(
        &mut self,
        services: Vec<Uuid>,
        timeout_ms: Option<u64>,
        reply: Reply,
    ) {
        if let Err(e) = self.guard_ready() {
            let _ = reply.send(Err(e));
            return;
        }
        if let Some(timer) = self.scan_timer.take() {
            timer.cancel();
        }
        // Each scan session starts from an empty registry.
        self.registry.clear();
        if let Err(e) = self.adapter.start_scan(&services).await {
            let _ = reply.send(Err(e));
            return;
        }
        self.scanning = true;
        info!("scan started ({} service filters)", services.len());
        if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
            let token = CancellationToken::new();
            let tx = self.timer_tx.clone();
            let child = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = child.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let _ = tx.send(TimerEvent::ScanTimeout);
                    }
                }
            });
            self.scan_timer = Some(token);
        }
        let _ = reply.send(Ok(json!({})));
    }

    async fn op_connect(&mut self, device_id: String, reply: Reply) {
        if let Err(e) = self.guard_ready() {
            let _ = reply.send(Err(e));
            return;
        }
        // Scanning interferes with connection setup on most stacks.
        if self.scanning {
            self.finish_scan().await;
        }
        let key = CallbackKey::device(OperationKind::Connect, &device_id);
        self.callbacks.register(key.clone(), reply);
        let Some(record) = self.registry.get(&device_id) else {
            self.callbacks
                .resolve(&key, Err(BleError::DeviceNotFound(device_id)));
            return;
        };
        if record.state == ConnectionState::Connected {
            // Already connected, report success without touching the link.
            let name = record.name.clone();
            self.current = Some(device_id.clone());
            self.callbacks
                .resolve(&key, Ok(json!({ "deviceId": device_id, "name": name })));
            return;
        }
        // At most one connection: a different current device is torn down
        // before the new connect is issued.
        if let Some(old) = self.current.clone() {
            if old != device_id {
                info!("disconnecting {old} before connecting {device_id}");
                self.intentional_disconnect = true;
                if let Err(e) = self.adapter.disconnect_device(&old).await {
                    warn!("teardown disconnect of {old} failed: {e}");
                }
                self.gatt.clear_device(&old);
                self.registry.set_state(&old, ConnectionState::Disconnected);
                self.current = None;
            }
        }
        self.registry.set_state(&device_id, ConnectionState::Connecting);
        if let Err(e) = self.adapter.connect_device(&device_id, ConnectOptions::default()).await {
            self.registry.set_state(&device_id, ConnectionState::Disconnected);
            self.callbacks.resolve(&key, Err(e));
        }
    }

    async fn op_disconnect(&mut self, device_id: String, reply: Reply) {
        let key = CallbackKey::device(OperationKind::Disconnect, &device_id);
        self.callbacks.register(key.clone(), reply);
        // A caller-requested disconnect always stops reconnection.
        self.reconnect.cancel(&device_id);
        let is_current = self.current.as_deref() == Some(device_id.as_str());
        if is_current && self.registry.state_of(&device_id) == Some(ConnectionState::Connected) {
            self.intentional_disconnect = true;
            self.registry.set_state(&device_id, ConnectionState::Disconnecting);
            if let Err(e) = self.adapter.disconnect_device(&device_id).await {
                self.intentional_disconnect = false;
                self.callbacks.resolve(&key, Err(e));
            }
        } else if is_current {
            // Connecting or half-open: nothing to tear down on the stack.
            self.clean_device(&device_id);
            self.callbacks
                .resolve(&key, Ok(json!({ "deviceId": device_id })));
        } else {
            self.callbacks
                .resolve(&key, Err(BleError::DeviceNotFound(device_id)));
        }
    }

    async fn op_get_services(&mut self, device_id: String, reply: Reply) {
        if let Err(e) = self.guard_connected(&device_id) {
            let _ = reply.send(Err(e));
            return;
        }
        let key = CallbackKey::device(OperationKind::ServicesDiscovery, &device_id);
        self.callbacks.register(key.clone(), reply);
        if let Err(e) = self.adapter.discover_services(&device_id, &[]).await {
            self.callbacks.resolve(&key, Err(e));
        }
    }

    async fn op_get_characteristics(&mut self, device_id: String, service_id: Uuid, reply: Reply) {
        if let Err(e) = self.guard_connected(&device_id) {
            let _ = reply.send(Err(e));
            return;
        }
        let key = CallbackKey::device(OperationKind::CharacteristicsDiscovery, &device_id);
        self.callbacks.register(key.clone(), reply);
        let issued = if self.gatt.has_service(&device_id, service_id) {
            self.adapter.discover_characteristics(&device_id, service_id).await
        } else {
            // Unknown service: discover it first, characteristic discovery
            // follows from the services-discovered handler.
            self.adapter.discover_services(&device_id, &[service_id]).await
        };
        if let Err(e) = issued {
            self.callbacks.resolve(&key, Err(e));
        }
    }

    async fn op_write(
        &mut self,
        device_id: String,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: Vec<u8>,
        reply: Reply,
    ) {
        if let Err(e) = self.guard_connected(&device_id) {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(info) = self.gatt.find_characteristic(&device_id, service_id, characteristic_id)
        else {
            let _ = reply.send(Err(BleError::CharacteristicNotFound(
                characteristic_id.to_string(),
            )));
            return;
        };
        let props = info.properties;
        if !props.supports_write() {
            let _ = reply.send(Err(BleError::WriteNotSupported));
            return;
        }
        if self.gatt.has_pending_write(&device_id, characteristic_id) {
            let _ = reply.send(Err(BleError::WriteInProgress(characteristic_id)));
            return;
        }
        if props.write {
            // With-response write: confirmed later by the stack.
            self.gatt.stash_write(&device_id, characteristic_id, value.clone());
            let key = CallbackKey::device(OperationKind::WriteCharacteristic, &device_id);
            self.callbacks.register(key.clone(), reply);
            if let Err(e) = self
                .adapter
                .write_characteristic(&device_id, characteristic_id, &value, WriteMode::WithResponse)
                .await
            {
                self.gatt.take_write(&device_id, characteristic_id);
                self.callbacks.resolve(&key, Err(e));
            }
        } else {
            // Without-response write: no confirmation will ever come.
            let result = self
                .adapter
                .write_characteristic(
                    &device_id,
                    characteristic_id,
                    &value,
                    WriteMode::WithoutResponse,
                )
                .await
                .map(|()| json!({ "characteristicId": characteristic_id, "value": to_hex(&value) }));
            let _ = reply.send(result);
        }
    }

    async fn op_set_notify(
        &mut self,
        device_id: String,
        service_id: Uuid,
        characteristic_id: Uuid,
        enable: bool,
        reply: Reply,
    ) {
        if let Err(e) = self.guard_connected(&device_id) {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(info) = self.gatt.find_characteristic(&device_id, service_id, characteristic_id)
        else {
            let _ = reply.send(Err(BleError::CharacteristicNotFound(
                characteristic_id.to_string(),
            )));
            return;
        };
        if !info.properties.supports_notify() {
            let _ = reply.send(Err(BleError::OperationNotSupported(
                "characteristic does not support notify".into(),
            )));
            return;
        }
        let key = CallbackKey::device(OperationKind::NotifyCharacteristic, &device_id);
        self.callbacks.register(key.clone(), reply);
        if let Err(e) = self.adapter.set_notify(&device_id, characteristic_id, enable).await {
            self.callbacks.resolve(&key, Err(e));
        }
    }

    async fn op_close_adapter(&mut self, reply: Reply) {
        if !self.opened {
            let _ = reply.send(Ok(json!({})));
            return;
        }
        info!("closing adapter session");
        self.finish_scan().await;
        self.reconnect.cancel_all();
        if let Some(current) = self.current.take() {
            if self.registry.state_of(&current) == Some(ConnectionState::Connected) {
                self.intentional_disconnect = true;
                if let Err(e) = self.adapter.disconnect_device(&current).await {
                    warn!("disconnect of {current} during close failed: {e}");
                }
            }
        }
        self.registry.clear();
        self.callbacks.clear();
        self.gatt.clear();
        self.intentional_disconnect = false;
        self.opened = false;
        self.scanning = false;
        self.power = PowerState::Unknown;
        let _ = reply.send(Ok(json!({})));
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged { power } => self.on_state_changed(power),
            AdapterEvent::DeviceDiscovered { device_id, local_name, name, rssi } => {
                // Nameless advertisements are noise for this bridge.
                let Some(final_name) = local_name.or(name) else {
                    return;
                };
                if self.registry.observe(&device_id, final_name.clone(), rssi) {
                    self.emit(BridgeEvent::DeviceFound { device_id, name: final_name, rssi });
                }
            }
            AdapterEvent::Connected { device_id } => self.on_connected(device_id),
            AdapterEvent::ConnectFailed { device_id, reason } => {
                self.on_connect_failed(device_id, reason);
            }
            AdapterEvent::Disconnected { device_id, error } => {
                self.on_disconnected(device_id, error);
            }
            AdapterEvent::ServicesDiscovered { device_id, result } => {
                self.on_services_discovered(device_id, result).await;
            }
            AdapterEvent::CharacteristicsDiscovered { device_id, service_id, result } => {
                self.on_characteristics_discovered(device_id, service_id, result);
            }
            AdapterEvent::ValueWritten { device_id, characteristic_id, error } => {
                let payload = self.gatt.take_write(&device_id, characteristic_id);
                let key = CallbackKey::device(OperationKind::WriteCharacteristic, &device_id);
                let result = match error {
                    Some(msg) => Err(BleError::Unknown(msg)),
                    None => Ok(json!({
                        "characteristicId": characteristic_id,
                        "value": payload.as_deref().map(to_hex).unwrap_or_default(),
                    })),
                };
                self.callbacks.resolve(&key, result);
            }
            AdapterEvent::ValueUpdated { device_id, characteristic_id, value } => {
                self.emit(BridgeEvent::CharacteristicValueChange {
                    device_id,
                    characteristic_id,
                    value: to_hex(&value),
                });
            }
            AdapterEvent::NotifyStateChanged {
                device_id,
                characteristic_id,
                is_notifying,
                error,
            } => {
                let key = CallbackKey::device(OperationKind::NotifyCharacteristic, &device_id);
                match error {
                    Some(msg) => {
                        self.callbacks.resolve(&key, Err(BleError::Unknown(msg)));
                    }
                    None => {
                        self.gatt.set_notifying(&device_id, characteristic_id, is_notifying);
                        self.callbacks.resolve(
                            &key,
                            Ok(json!({
                                "characteristicId": characteristic_id,
                                "isNotifying": is_notifying,
                            })),
                        );
                        self.emit(BridgeEvent::NotificationStateChange {
                            device_id,
                            characteristic_id,
                            is_notifying,
                        });
                    }
                }
            }
        }
    }

    fn on_state_changed(&mut self, power: PowerState) {
        info!("adapter state changed: {power}");
        self.power = power;
        let init_key = CallbackKey::global(OperationKind::Init);
        if self.callbacks.contains(&init_key)
            && !matches!(power, PowerState::Unknown | PowerState::Resetting)
        {
            let result = match (self.adapter.permission(), power) {
                (PermissionState::Denied | PermissionState::Restricted, _) => {
                    Err(BleError::PermissionDenied)
                }
                (PermissionState::NotDetermined, _) => Err(BleError::PermissionNotDetermined),
                (_, PowerState::PoweredOn) => Ok(json!({ "available": true })),
                (_, p) => Err(BleError::AdapterNotReady(p.to_string())),
            };
            self.callbacks.resolve(&init_key, result);
        }
        let lost = matches!(
            power,
            PowerState::PoweredOff | PowerState::Unsupported | PowerState::Unauthorized
        );
        if lost && self.opened {
            // Radio gone: every in-flight operation fails the same way and
            // connection state is no longer trustworthy.
            self.scanning = false;
            if let Some(timer) = self.scan_timer.take() {
                timer.cancel();
            }
            self.callbacks.fail_all(BleError::AdapterNotReady(power.to_string()));
            if let Some(current) = self.current.take() {
                self.registry.set_state(&current, ConnectionState::Disconnected);
                self.gatt.clear_device(&current);
            }
            self.reconnect.cancel_all();
        }
    }

    fn on_connected(&mut self, device_id: String) {
        let name = self.registry.name_of(&device_id);
        self.registry.set_state(&device_id, ConnectionState::Connected);
        self.current = Some(device_id.clone());
        if let Some(attempt) = self.reconnect.attempt_of(&device_id) {
            info!("reconnected to {device_id} on attempt {attempt}");
            self.reconnect.cancel(&device_id);
            self.emit(BridgeEvent::ConnectionStateChange {
                device_id: device_id.clone(),
                name: name.clone(),
                is_connected: true,
                unexpected: None,
                is_reconnection: Some(true),
                attempt: Some(attempt),
                reconnection_failed: None,
                reason: None,
            });
        }
        let key = CallbackKey::device(OperationKind::Connect, &device_id);
        self.callbacks
            .resolve(&key, Ok(json!({ "deviceId": device_id, "name": name })));
    }

    fn on_connect_failed(&mut self, device_id: String, reason: String) {
        self.registry.set_state(&device_id, ConnectionState::Disconnected);
        if self.current.as_deref() == Some(device_id.as_str()) {
            self.current = None;
        }
        if let Some(attempt) = self.reconnect.attempt_of(&device_id) {
            warn!("reconnect attempt {attempt} to {device_id} failed: {reason}");
            self.schedule_reconnect(&device_id, attempt + 1);
        } else {
            let key = CallbackKey::device(OperationKind::Connect, &device_id);
            self.callbacks.resolve(&key, Err(BleError::Unknown(reason)));
        }
    }

    fn on_disconnected(&mut self, device_id: String, error: Option<String>) {
        // Disconnects surfacing after close are stale.
        if !self.opened {
            return;
        }
        let intentional = self.intentional_disconnect;
        self.intentional_disconnect = false;
        let unexpected = error.is_some() && !intentional;
        let name = self.registry.name_of(&device_id);
        self.clean_device(&device_id);
        let key = CallbackKey::device(OperationKind::Disconnect, &device_id);
        self.callbacks
            .resolve(&key, Ok(json!({ "deviceId": device_id })));
        self.emit(BridgeEvent::connection_change(
            device_id.clone(),
            name,
            false,
            Some(unexpected),
        ));
        if unexpected {
            warn!(
                "unexpected disconnect from {device_id}: {}",
                error.as_deref().unwrap_or("unknown")
            );
            self.reconnect.begin(&device_id);
            self.schedule_reconnect(&device_id, 1);
        } else {
            self.reconnect.cancel(&device_id);
        }
    }

    async fn on_services_discovered(
        &mut self,
        device_id: String,
        result: std::result::Result<Vec<crate::types::ServiceInfo>, String>,
    ) {
        let key = CallbackKey::device(OperationKind::ServicesDiscovery, &device_id);
        match result {
            Err(msg) => {
                self.callbacks.resolve(&key, Err(BleError::Unknown(msg)));
            }
            Ok(services) if services.is_empty() => {
                self.callbacks.resolve(
                    &key,
                    Err(BleError::ServiceNotFound("no services discovered".into())),
                );
            }
            Ok(services) => {
                self.gatt.put_services(&device_id, services.clone());
                // Warm the characteristic cache for every service so writes
                // and notify requests can resolve properties locally.
                for svc in &services {
                    if let Err(e) = self
                        .adapter
                        .discover_characteristics(&device_id, svc.service_id)
                        .await
                    {
                        warn!(
                            "characteristic discovery for {} on {device_id} not issued: {e}",
                            svc.service_id
                        );
                    }
                }
                self.callbacks.resolve(&key, Ok(json!({ "services": services })));
            }
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        device_id: String,
        service_id: Uuid,
        result: std::result::Result<Vec<crate::types::CharacteristicInfo>, String>,
    ) {
        let key = CallbackKey::device(OperationKind::CharacteristicsDiscovery, &device_id);
        match result {
            Err(msg) => {
                self.callbacks.resolve(&key, Err(BleError::Unknown(msg)));
            }
            Ok(chars) if chars.is_empty() => {
                self.callbacks.resolve(
                    &key,
                    Err(BleError::CharacteristicNotFound(service_id.to_string())),
                );
            }
            Ok(chars) => {
                self.gatt.put_characteristics(&device_id, service_id, chars);
                // A pending caller is answered once with the union of every
                // service's characteristics, not per-service fragments.
                if self.callbacks.contains(&key) && self.gatt.is_complete(&device_id) {
                    let all = self.gatt.aggregate(&device_id);
                    self.callbacks
                        .resolve(&key, Ok(json!({ "characteristics": all })));
                }
            }
        }
    }
}
