//! Host adapter abstraction.
//! The session core never talks to a bluetooth stack directly: it issues
//! requests through [`HostAdapter`] and consumes completions as
//! [`AdapterEvent`]s on a channel. This keeps the core testable against a
//! mock adapter and portable across platform stacks.

#[cfg(feature = "bluest")]
pub mod bluest;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{CharacteristicInfo, PermissionState, PowerState, ServiceInfo};

/// Options applied when issuing a connect request.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Ask the stack to report the connection event.
    pub notify_on_connection: bool,
    /// Ask the stack to report the disconnection event.
    pub notify_on_disconnection: bool,
    /// Delay before the stack starts connecting, in milliseconds.
    pub start_delay_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            notify_on_connection: true,
            notify_on_disconnection: true,
            start_delay_ms: 0,
        }
    }
}

/// Write mode for a characteristic write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Delegate-style completions and unsolicited pushes from the hardware
/// stack. One event loop consumes all of them.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Adapter power or permission state changed.
    StateChanged { power: PowerState },
    /// A peripheral was seen during a scan.
    DeviceDiscovered {
        device_id: String,
        /// Name from the advertisement payload, preferred when present.
        local_name: Option<String>,
        /// Name reported by the device itself.
        name: Option<String>,
        rssi: i16,
    },
    /// A connect request completed successfully.
    Connected { device_id: String },
    /// A connect request failed.
    ConnectFailed { device_id: String, reason: String },
    /// The link to a peripheral dropped. An error marks a disconnect the
    /// hardware reported rather than one the central requested.
    Disconnected {
        device_id: String,
        error: Option<String>,
    },
    /// Service enumeration finished.
    ServicesDiscovered {
        device_id: String,
        result: std::result::Result<Vec<ServiceInfo>, String>,
    },
    /// Characteristic enumeration for one service finished.
    CharacteristicsDiscovered {
        device_id: String,
        service_id: Uuid,
        result: std::result::Result<Vec<CharacteristicInfo>, String>,
    },
    /// A with-response write was confirmed (or failed).
    ValueWritten {
        device_id: String,
        characteristic_id: Uuid,
        error: Option<String>,
    },
    /// The peripheral pushed a new characteristic value.
    ValueUpdated {
        device_id: String,
        characteristic_id: Uuid,
        value: Vec<u8>,
    },
    /// A notify-subscription change was acknowledged.
    NotifyStateChanged {
        device_id: String,
        characteristic_id: Uuid,
        is_notifying: bool,
        error: Option<String>,
    },
}

/// Asynchronous, fire-and-forget primitives of the host bluetooth stack.
///
/// Every method returns as soon as the request is issued; the actual result
/// arrives later as an [`AdapterEvent`]. Requests already in flight cannot
/// be cancelled — callers cancel by ignoring the eventual event.
#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// Current power state of the adapter hardware.
    fn power_state(&self) -> PowerState;

    /// Current bluetooth permission state.
    fn permission(&self) -> PermissionState;

    /// Triggers the platform permission prompt. The outcome arrives as a
    /// [`AdapterEvent::StateChanged`].
    async fn request_permission(&self) -> Result<()>;

    /// Starts scanning, optionally filtered to the given service ids.
    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()>;

    /// Stops an in-progress scan. No-op when not scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Issues a connect request for the device.
    async fn connect_device(&self, device_id: &str, options: ConnectOptions) -> Result<()>;

    /// Issues a disconnect request for the device.
    async fn disconnect_device(&self, device_id: &str) -> Result<()>;

    /// Enumerates services, optionally filtered to the given ids.
    async fn discover_services(&self, device_id: &str, service_filter: &[Uuid]) -> Result<()>;

    /// Enumerates characteristics of one discovered service.
    async fn discover_characteristics(&self, device_id: &str, service_id: Uuid) -> Result<()>;

    /// Writes bytes to a characteristic. Only `WithResponse` writes produce
    /// a [`AdapterEvent::ValueWritten`] confirmation.
    async fn write_characteristic(
        &self,
        device_id: &str,
        characteristic_id: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Enables or disables value-change notifications for a characteristic.
    async fn set_notify(&self, device_id: &str, characteristic_id: Uuid, enable: bool)
    -> Result<()>;
}
