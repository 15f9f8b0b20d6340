//! Error taxonomy for bluetooth operations.
//! Every variant carries a stable numeric code so that bridge callers on the
//! JS side can switch on it without parsing messages.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to bridge callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// Bluetooth permission was denied by the user or a system policy.
    #[error("bluetooth permission denied")]
    PermissionDenied,

    /// Bluetooth permission has not been requested yet.
    #[error("bluetooth permission not determined")]
    PermissionNotDetermined,

    /// The adapter is powered off, unsupported or otherwise unavailable.
    #[error("bluetooth adapter not ready: {0}")]
    AdapterNotReady(String),

    /// An operation was issued before `initAdapter`.
    #[error("bluetooth adapter not initialized")]
    AdapterNotInitialized,

    /// The device is unknown to the registry or not connected.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A connection attempt timed out.
    #[error("connect timeout")]
    ConnectTimeout,

    /// Service discovery returned nothing, or the service id is unknown.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The characteristic id is not in the discovery cache.
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// The characteristic supports neither write mode.
    #[error("characteristic does not support write")]
    WriteNotSupported,

    /// A with-response write is still awaiting its confirmation.
    #[error("write already in progress for characteristic {0}")]
    WriteInProgress(Uuid),

    /// The characteristic does not support the requested operation.
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// A required parameter is missing or malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Any underlying hardware-stack error, wrapped with its message.
    #[error("{0}")]
    Unknown(String),
}

impl BleError {
    /// Stable bridge error code. Codes in the 10000 range follow the
    /// uni-app bluetooth convention; negative codes are extensions.
    pub fn code(&self) -> i32 {
        match self {
            BleError::AdapterNotReady(_) => -1,
            BleError::PermissionDenied => -2,
            BleError::DeviceNotFound(_) => -3,
            BleError::ConnectTimeout => -4,
            BleError::CharacteristicNotFound(_) => -5,
            BleError::WriteNotSupported => -6,
            BleError::PermissionNotDetermined => -7,
            BleError::AdapterNotInitialized => 10000,
            BleError::ServiceNotFound(_) => 10004,
            BleError::OperationNotSupported(_) => 10007,
            BleError::InvalidParameter(_) => 10013,
            BleError::WriteInProgress(_) => 10014,
            BleError::Unknown(_) => -99,
        }
    }
}

pub type Result<T> = std::result::Result<T, BleError>;
