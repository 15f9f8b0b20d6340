//! Push events delivered to bridge listeners.
//! These are broadcast, not request/response: a listener subscribes once and
//! receives everything emitted while it is alive.

use serde::Serialize;
use uuid::Uuid;

/// Events pushed to all current bridge listeners. Serialized with an
/// `eventName` tag so the JS side can route on it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventName")]
pub enum BridgeEvent {
    /// First sighting of a device during a scan session.
    #[serde(rename = "onDeviceFound")]
    #[serde(rename_all = "camelCase")]
    DeviceFound {
        device_id: String,
        name: String,
        rssi: i16,
    },

    /// Connection gained or lost, including reconnection progress.
    #[serde(rename = "onConnectionStateChange")]
    #[serde(rename_all = "camelCase")]
    ConnectionStateChange {
        device_id: String,
        name: Option<String>,
        is_connected: bool,
        /// Set on disconnects: true when the hardware reported an error and
        /// no caller asked for the disconnect.
        #[serde(skip_serializing_if = "Option::is_none")]
        unexpected: Option<bool>,
        /// Set when this connect closed out a reconnection attempt.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_reconnection: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        /// Set when the reconnection policy gave up on the device.
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnection_failed: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Unsolicited value push from a subscribed characteristic.
    #[serde(rename = "onCharacteristicValueChange")]
    #[serde(rename_all = "camelCase")]
    CharacteristicValueChange {
        device_id: String,
        characteristic_id: Uuid,
        /// Hex-encoded payload bytes.
        value: String,
    },

    /// Notify subscription toggled on or off.
    #[serde(rename = "onNotificationStateChange")]
    #[serde(rename_all = "camelCase")]
    NotificationStateChange {
        device_id: String,
        characteristic_id: Uuid,
        is_notifying: bool,
    },
}

impl BridgeEvent {
    /// Plain disconnect/connect notification without reconnection fields.
    pub(crate) fn connection_change(
        device_id: String,
        name: Option<String>,
        is_connected: bool,
        unexpected: Option<bool>,
    ) -> Self {
        BridgeEvent::ConnectionStateChange {
            device_id,
            name,
            is_connected,
            unexpected,
            is_reconnection: None,
            attempt: None,
            reconnection_failed: None,
            reason: None,
        }
    }
}
