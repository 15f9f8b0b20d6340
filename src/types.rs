//! Shared data structures for the bluetooth session core.

use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Connection state of a peripheral, mirrored from adapter events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Power state of the host bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Unknown => "unknown",
            PowerState::Resetting => "resetting",
            PowerState::Unsupported => "unsupported",
            PowerState::Unauthorized => "unauthorized",
            PowerState::PoweredOff => "powered off",
            PowerState::PoweredOn => "powered on",
        };
        f.write_str(s)
    }
}

/// Bluetooth permission state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    NotDetermined,
    Restricted,
    Denied,
    Authorized,
}

/// A discovered device as exposed to bridge callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothDevice {
    /// Stable opaque identifier (platform UUID string).
    pub device_id: String,
    /// Advertised or device-reported name.
    pub name: Option<String>,
    /// Last-seen signal strength in dBm.
    pub rssi: i16,
}

/// Registry entry for a device seen during the current scan session.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub state: ConnectionState,
}

impl DeviceRecord {
    pub fn snapshot(&self) -> BluetoothDevice {
        BluetoothDevice {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
        }
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_id: Uuid,
    pub is_primary: bool,
}

/// Property flags of a GATT characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
    pub broadcast: bool,
}

impl CharacteristicProps {
    pub fn supports_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn supports_notify(&self) -> bool {
        self.notify || self.indicate
    }

    /// Property names in the order bridge callers expect them.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.read {
            names.push("read");
        }
        if self.write {
            names.push("write");
        }
        if self.write_without_response {
            names.push("writeWithoutResponse");
        }
        if self.notify {
            names.push("notify");
        }
        if self.indicate {
            names.push("indicate");
        }
        if self.broadcast {
            names.push("broadcast");
        }
        names
    }
}

// Bridge callers receive properties as a list of names, not a bitmask.
impl Serialize for CharacteristicProps {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicInfo {
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub properties: CharacteristicProps,
    pub is_notifying: bool,
}
