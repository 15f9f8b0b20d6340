//! Registry of devices discovered during the current scan session.
//! Devices are deduplicated by id and kept in discovery order; repeat
//! sightings only refresh the cached RSSI.

use log::debug;

use crate::types::{BluetoothDevice, ConnectionState, DeviceRecord};

#[derive(Default)]
pub(crate) struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Records a sighting. Returns true on the first sighting of the id;
    /// later sightings only update the RSSI cache.
    pub fn observe(&mut self, device_id: &str, name: String, rssi: i16) -> bool {
        if let Some(record) = self.devices.iter_mut().find(|d| d.device_id == device_id) {
            record.rssi = rssi;
            false
        } else {
            debug!("new device discovered: {name} ({device_id}), rssi {rssi}");
            self.devices.push(DeviceRecord {
                device_id: device_id.to_string(),
                name: Some(name),
                rssi,
                state: ConnectionState::Disconnected,
            });
            true
        }
    }

    pub fn set_state(&mut self, device_id: &str, state: ConnectionState) {
        if let Some(record) = self.devices.iter_mut().find(|d| d.device_id == device_id) {
            record.state = state;
        }
    }

    pub fn state_of(&self, device_id: &str) -> Option<ConnectionState> {
        self.get(device_id).map(|d| d.state)
    }

    pub fn name_of(&self, device_id: &str) -> Option<String> {
        self.get(device_id).and_then(|d| d.name.clone())
    }

    pub fn snapshot(&self) -> Vec<BluetoothDevice> {
        self.devices.iter().map(DeviceRecord::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}
