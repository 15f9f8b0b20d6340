//! Per-device GATT discovery cache.
//! Discovery is layered: characteristics for a service are only valid once
//! that service is cached, and a device's cache is complete only when every
//! cached service has a characteristic entry. Outbound write payloads are
//! stashed here because write confirmations may not echo them.

use std::collections::HashMap;

use uuid::Uuid;

use crate::types::{CharacteristicInfo, ServiceInfo};

#[derive(Default)]
pub(crate) struct GattCache {
    /// Discovered services per device.
    services: HashMap<String, Vec<ServiceInfo>>,
    /// Discovered characteristics per (device, service).
    characteristics: HashMap<(String, Uuid), Vec<CharacteristicInfo>>,
    /// Outbound payload of an unconfirmed with-response write, per
    /// (device, characteristic).
    pending_writes: HashMap<(String, Uuid), Vec<u8>>,
}

impl GattCache {
    pub fn put_services(&mut self, device_id: &str, services: Vec<ServiceInfo>) {
        self.services.insert(device_id.to_string(), services);
    }

    pub fn services(&self, device_id: &str) -> Option<&[ServiceInfo]> {
        self.services.get(device_id).map(Vec::as_slice)
    }

    pub fn has_service(&self, device_id: &str, service_id: Uuid) -> bool {
        self.services(device_id)
            .is_some_and(|s| s.iter().any(|svc| svc.service_id == service_id))
    }

    pub fn put_characteristics(
        &mut self,
        device_id: &str,
        service_id: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    ) {
        self.characteristics
            .insert((device_id.to_string(), service_id), characteristics);
    }

    pub fn find_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Option<&CharacteristicInfo> {
        self.characteristics
            .get(&(device_id.to_string(), service_id))?
            .iter()
            .find(|c| c.characteristic_id == characteristic_id)
    }

    pub fn set_notifying(&mut self, device_id: &str, characteristic_id: Uuid, notifying: bool) {
        for ((dev, _), chars) in self.characteristics.iter_mut() {
            if dev != device_id {
                continue;
            }
            for c in chars.iter_mut() {
                if c.characteristic_id == characteristic_id {
                    c.is_notifying = notifying;
                }
            }
        }
    }

    /// True once every cached service of the device has a characteristic
    /// entry. False when no services are cached at all.
    pub fn is_complete(&self, device_id: &str) -> bool {
        match self.services.get(device_id) {
            Some(services) if !services.is_empty() => services.iter().all(|svc| {
                self.characteristics
                    .contains_key(&(device_id.to_string(), svc.service_id))
            }),
            _ => false,
        }
    }

    /// Union of all cached characteristics of the device, in service order.
    pub fn aggregate(&self, device_id: &str) -> Vec<CharacteristicInfo> {
        let mut all = Vec::new();
        if let Some(services) = self.services.get(device_id) {
            for svc in services {
                if let Some(chars) = self
                    .characteristics
                    .get(&(device_id.to_string(), svc.service_id))
                {
                    all.extend(chars.iter().cloned());
                }
            }
        }
        all
    }

    pub fn stash_write(&mut self, device_id: &str, characteristic_id: Uuid, value: Vec<u8>) {
        self.pending_writes
            .insert((device_id.to_string(), characteristic_id), value);
    }

    pub fn take_write(&mut self, device_id: &str, characteristic_id: Uuid) -> Option<Vec<u8>> {
        self.pending_writes
            .remove(&(device_id.to_string(), characteristic_id))
    }

    pub fn has_pending_write(&self, device_id: &str, characteristic_id: Uuid) -> bool {
        self.pending_writes
            .contains_key(&(device_id.to_string(), characteristic_id))
    }

    /// Drops everything cached for one device (on disconnect).
    pub fn clear_device(&mut self, device_id: &str) {
        self.services.remove(device_id);
        self.characteristics.retain(|(dev, _), _| dev != device_id);
        self.pending_writes.retain(|(dev, _), _| dev != device_id);
    }

    /// Drops everything (on adapter close).
    pub fn clear(&mut self) {
        self.services.clear();
        self.characteristics.clear();
        self.pending_writes.clear();
    }
}
