//! [`HostAdapter`] backed by the `bluest` cross-platform bluetooth stack.
//!
//! Desktop stacks have no permission prompt, so permission is always
//! reported as authorized and the power state flips to powered-on once the
//! adapter reports itself available. Requests run in spawned tasks and
//! report their outcome on the adapter-event channel, matching the
//! fire-and-forget contract of the trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, ConnectOptions, HostAdapter, WriteMode};
use crate::error::{BleError, Result};
use crate::types::{
    CharacteristicInfo, CharacteristicProps, PermissionState, PowerState, ServiceInfo,
};

type DeviceMap = Arc<Mutex<HashMap<String, Device>>>;
type ServiceMap = Arc<Mutex<HashMap<(String, Uuid), Service>>>;
type CharacteristicMap = Arc<Mutex<HashMap<(String, Uuid), Characteristic>>>;

pub struct BluestAdapter {
    adapter: Adapter,
    events: mpsc::UnboundedSender<AdapterEvent>,
    power: Mutex<PowerState>,
    devices: DeviceMap,
    services: ServiceMap,
    characteristics: CharacteristicMap,
    scan_cancel: Mutex<Option<CancellationToken>>,
    notify_cancel: Mutex<HashMap<(String, Uuid), CancellationToken>>,
}

impl BluestAdapter {
    /// Opens the default system adapter, waits for it to become available
    /// and returns the adapter together with its event channel.
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<AdapterEvent>)> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BleError::AdapterNotReady("no default bluetooth adapter".into()))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| BleError::AdapterNotReady(e.to_string()))?;
        info!("system bluetooth adapter available");
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            adapter,
            events: tx,
            power: Mutex::new(PowerState::PoweredOn),
            devices: Arc::new(Mutex::new(HashMap::new())),
            services: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: Mutex::new(None),
            notify_cancel: Mutex::new(HashMap::new()),
        });
        this.send(AdapterEvent::StateChanged { power: PowerState::PoweredOn });
        Ok((this, rx))
    }

    fn send(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            debug!("adapter event dropped, session is gone");
        }
    }

    fn device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))
    }

    fn characteristic(&self, device_id: &str, characteristic_id: Uuid) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), characteristic_id))
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound(characteristic_id.to_string()))
    }
}

fn props_from(props: bluest::CharacteristicProperties) -> CharacteristicProps {
    CharacteristicProps {
        read: props.read,
        write: props.write,
        write_without_response: props.write_without_response,
        notify: props.notify,
        indicate: props.indicate,
        broadcast: props.broadcast,
    }
}

#[async_trait]
impl HostAdapter for BluestAdapter {
    fn power_state(&self) -> PowerState {
        *self.power.lock().unwrap()
    }

    fn permission(&self) -> PermissionState {
        // Desktop stacks gate bluetooth at install time, not per-app.
        PermissionState::Authorized
    }

    async fn request_permission(&self) -> Result<()> {
        self.send(AdapterEvent::StateChanged { power: self.power_state() });
        Ok(())
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
        {
            let mut slot = self.scan_cancel.lock().unwrap();
            if let Some(old) = slot.take() {
                old.cancel();
            }
        }
        let token = CancellationToken::new();
        *self.scan_cancel.lock().unwrap() = Some(token.clone());

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let devices = self.devices.clone();
        let filter = service_filter.to_vec();
        tokio::spawn(async move {
            let mut stream = match adapter.scan(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("scan failed to start: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    found = stream.next() => {
                        let Some(found) = found else { break };
                        let device = found.device;
                        let device_id = device.id().to_string();
                        let local_name = found.adv_data.local_name.clone();
                        let name = device.name().ok();
                        let rssi = found.rssi.unwrap_or(0);
                        devices.lock().unwrap().insert(device_id.clone(), device);
                        let _ = events.send(AdapterEvent::DeviceDiscovered {
                            device_id,
                            local_name,
                            name,
                            rssi,
                        });
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("scan stream ended");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn connect_device(&self, device_id: &str, _options: ConnectOptions) -> Result<()> {
        let device = self.device(device_id)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            match adapter.connect_device(&device).await {
                Ok(()) => {
                    let _ = events.send(AdapterEvent::Connected { device_id });
                }
                Err(e) => {
                    warn!("connect to {device_id} failed: {e}");
                    let _ = events.send(AdapterEvent::ConnectFailed {
                        device_id,
                        reason: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect_device(&self, device_id: &str) -> Result<()> {
        let device = self.device(device_id)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = adapter.disconnect_device(&device).await {
                warn!("disconnect of {device_id} failed: {e}");
            }
            // Requested disconnects are reported without an error.
            let _ = events.send(AdapterEvent::Disconnected { device_id, error: None });
        });
        Ok(())
    }

    async fn discover_services(&self, device_id: &str, service_filter: &[Uuid]) -> Result<()> {
        let device = self.device(device_id)?;
        let events = self.events.clone();
        let services_map = self.services.clone();
        let filter = service_filter.to_vec();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let result = match device.discover_services().await {
                Ok(services) => {
                    let mut infos = Vec::new();
                    let mut map = services_map.lock().unwrap();
                    for service in services {
                        let uuid = service.uuid();
                        if !filter.is_empty() && !filter.contains(&uuid) {
                            continue;
                        }
                        map.insert((device_id.clone(), uuid), service);
                        infos.push(ServiceInfo { service_id: uuid, is_primary: true });
                    }
                    Ok(infos)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(AdapterEvent::ServicesDiscovered { device_id, result });
        });
        Ok(())
    }

    async fn discover_characteristics(&self, device_id: &str, service_id: Uuid) -> Result<()> {
        let service = self
            .services
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), service_id))
            .cloned()
            .ok_or_else(|| BleError::ServiceNotFound(service_id.to_string()))?;
        let events = self.events.clone();
        let chars_map = self.characteristics.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let result = match service.discover_characteristics().await {
                Ok(chars) => {
                    let mut infos = Vec::new();
                    for characteristic in chars {
                        let uuid = characteristic.uuid();
                        let props = match characteristic.properties().await {
                            Ok(p) => props_from(p),
                            Err(e) => {
                                debug!("properties of {uuid} unavailable: {e}");
                                CharacteristicProps::default()
                            }
                        };
                        chars_map
                            .lock()
                            .unwrap()
                            .insert((device_id.clone(), uuid), characteristic);
                        infos.push(CharacteristicInfo {
                            service_id,
                            characteristic_id: uuid,
                            properties: props,
                            is_notifying: false,
                        });
                    }
                    Ok(infos)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(AdapterEvent::CharacteristicsDiscovered {
                device_id,
                service_id,
                result,
            });
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        characteristic_id: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let characteristic = self.characteristic(device_id, characteristic_id)?;
        let events = self.events.clone();
        let device_id = device_id.to_string();
        let value = value.to_vec();
        tokio::spawn(async move {
            match mode {
                WriteMode::WithResponse => {
                    let error = characteristic.write(&value).await.err().map(|e| e.to_string());
                    let _ = events.send(AdapterEvent::ValueWritten {
                        device_id,
                        characteristic_id,
                        error,
                    });
                }
                WriteMode::WithoutResponse => {
                    // No confirmation event for unacknowledged writes.
                    if let Err(e) = characteristic.write_without_response(&value).await {
                        warn!("write without response to {characteristic_id} failed: {e}");
                    }
                }
            }
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        device_id: &str,
        characteristic_id: Uuid,
        enable: bool,
    ) -> Result<()> {
        let key = (device_id.to_string(), characteristic_id);
        if !enable {
            if let Some(token) = self.notify_cancel.lock().unwrap().remove(&key) {
                token.cancel();
            }
            self.send(AdapterEvent::NotifyStateChanged {
                device_id: device_id.to_string(),
                characteristic_id,
                is_notifying: false,
                error: None,
            });
            return Ok(());
        }

        let characteristic = self.characteristic(device_id, characteristic_id)?;
        let token = CancellationToken::new();
        if let Some(old) = self
            .notify_cancel
            .lock()
            .unwrap()
            .insert(key, token.clone())
        {
            old.cancel();
        }
        let events = self.events.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(AdapterEvent::NotifyStateChanged {
                        device_id,
                        characteristic_id,
                        is_notifying: false,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            let _ = events.send(AdapterEvent::NotifyStateChanged {
                device_id: device_id.clone(),
                characteristic_id,
                is_notifying: true,
                error: None,
            });
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(Ok(value)) => {
                            let _ = events.send(AdapterEvent::ValueUpdated {
                                device_id: device_id.clone(),
                                characteristic_id,
                                value,
                            });
                        }
                        Some(Err(e)) => {
                            error!("notification stream error on {characteristic_id}: {e}");
                            break;
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            debug!("notification stream for {characteristic_id} ended");
        });
        Ok(())
    }
}
