//! Pending-callback registry.
//! Each in-flight operation parks exactly one reply channel under a
//! composite key of operation kind and device id. Registering a new reply
//! under an occupied key drops the previous sender, which the abandoned
//! waiter observes as a closed channel. Events that find no entry for their
//! key are dropped by the caller (at-most-once, best-effort delivery).

use std::collections::HashMap;

use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{BleError, Result};

/// Operation kinds that can have a pending reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OperationKind {
    /// Adapter init / permission request, resolved by a state change.
    Init,
    Connect,
    Disconnect,
    ServicesDiscovery,
    CharacteristicsDiscovery,
    WriteCharacteristic,
    NotifyCharacteristic,
}

/// Composite callback key. Device ids are carried as a separate field, so
/// identifiers containing arbitrary characters cannot collide with keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CallbackKey {
    pub kind: OperationKind,
    pub device_id: Option<String>,
}

impl CallbackKey {
    pub fn global(kind: OperationKind) -> Self {
        Self { kind, device_id: None }
    }

    pub fn device(kind: OperationKind, device_id: &str) -> Self {
        Self { kind, device_id: Some(device_id.to_string()) }
    }
}

pub(crate) type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    pending: HashMap<CallbackKey, Reply>,
}

impl CallbackRegistry {
    /// Parks a reply under the key, abandoning any previous one.
    pub fn register(&mut self, key: CallbackKey, reply: Reply) {
        if self.pending.insert(key.clone(), reply).is_some() {
            debug!("pending callback replaced: {key:?}");
        }
    }

    pub fn take(&mut self, key: &CallbackKey) -> Option<Reply> {
        self.pending.remove(key)
    }

    pub fn contains(&self, key: &CallbackKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Resolves and removes the entry. Returns false when no reply was
    /// pending, in which case the event is simply dropped.
    pub fn resolve(&mut self, key: &CallbackKey, result: Result<Value>) -> bool {
        match self.pending.remove(key) {
            Some(reply) => {
                let _ = reply.send(result);
                true
            }
            None => {
                debug!("no pending callback for {key:?}, dropping result");
                false
            }
        }
    }

    /// Fails every pending reply with the same error. Used by the adapter
    /// state tracker when the hardware leaves the powered-on state.
    pub fn fail_all(&mut self, error: BleError) {
        for (key, reply) in self.pending.drain() {
            debug!("failing pending callback {key:?}: {error}");
            let _ = reply.send(Err(error.clone()));
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
