//! Bridge call surface.
//! Maps string-addressed actions with JSON parameters onto session
//! operations and folds every outcome into a `{code, message, data}`
//! envelope, so callers on the far side of the bridge never see a raw
//! error type.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BleError, Result};
use crate::session::BleHandle;

/// Response envelope returned for every bridge action. `code` 0 means
/// success; any other value is a [`BleError`] code.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeResponse {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl BridgeResponse {
    pub fn success(data: Value) -> Self {
        Self { code: 0, message: "ok".into(), data }
    }

    pub fn failure(error: &BleError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl From<Result<Value>> for BridgeResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(data) => BridgeResponse::success(data),
            Err(e) => BridgeResponse::failure(&e),
        }
    }
}

/// Dispatches one bridge action against a running session.
pub async fn dispatch(handle: &BleHandle, action: &str, params: &Value) -> BridgeResponse {
    match run_action(handle, action, params).await {
        Ok(data) => BridgeResponse::success(data),
        Err(e) => {
            log::debug!("bridge action {action} failed: {e}");
            BridgeResponse::failure(&e)
        }
    }
}

async fn run_action(handle: &BleHandle, action: &str, params: &Value) -> Result<Value> {
    match action {
        "initAdapter" => handle.init_adapter().await,
        "requestPermission" => handle.request_permission().await,
        "checkPermission" => handle.check_permission().await,
        "startScan" => {
            let services = uuid_list_param(params, "services")?;
            let timeout_ms = params.get("timeout").and_then(Value::as_u64);
            handle.start_scan(services, timeout_ms).await
        }
        "stopScan" => handle.stop_scan().await,
        "connect" => handle.connect(str_param(params, "deviceId")?).await,
        "disconnect" => handle.disconnect(str_param(params, "deviceId")?).await,
        "getServices" => handle.get_services(str_param(params, "deviceId")?).await,
        "getCharacteristics" => {
            let device_id = str_param(params, "deviceId")?;
            let service_id = uuid_param(params, "serviceId")?;
            handle.get_characteristics(device_id, service_id).await
        }
        "writeCharacteristic" => {
            let device_id = str_param(params, "deviceId")?;
            let service_id = uuid_param(params, "serviceId")?;
            let characteristic_id = uuid_param(params, "characteristicId")?;
            let value = str_param(params, "value")?;
            let encoding = params.get("valueEncoding").and_then(Value::as_str);
            handle
                .write_characteristic(device_id, service_id, characteristic_id, value, encoding)
                .await
        }
        "setNotify" => {
            let device_id = str_param(params, "deviceId")?;
            let service_id = uuid_param(params, "serviceId")?;
            let characteristic_id = uuid_param(params, "characteristicId")?;
            let enable = bool_param(params, "enable")?;
            handle
                .set_notify(device_id, service_id, characteristic_id, enable)
                .await
        }
        "closeAdapter" => handle.close_adapter().await,
        "getAdapterState" => handle.get_adapter_state().await,
        "getDiscoveredDevices" => handle.get_discovered_devices().await,
        other => Err(BleError::OperationNotSupported(format!(
            "unknown bridge action: {other}"
        ))),
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BleError::InvalidParameter(format!("missing parameter: {key}")))
}

fn bool_param(params: &Value, key: &str) -> Result<bool> {
    params
        .get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| BleError::InvalidParameter(format!("missing parameter: {key}")))
}

fn uuid_param(params: &Value, key: &str) -> Result<Uuid> {
    let raw = str_param(params, key)?;
    Uuid::parse_str(raw)
        .map_err(|_| BleError::InvalidParameter(format!("{key} is not a valid uuid: {raw}")))
}

/// Optional uuid-array parameter; absent means no filter.
fn uuid_list_param(params: &Value, key: &str) -> Result<Vec<Uuid>> {
    let Some(raw) = params.get(key) else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(BleError::InvalidParameter(format!("{key} must be an array")));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    BleError::InvalidParameter(format!("{key} contains an invalid uuid"))
                })
        })
        .collect()
}
