//! BLE bridge session core.
//!
//! The crate drives a host bluetooth stack on behalf of a JS bridge caller:
//! it keeps a registry of discovered devices, enforces a single active
//! connection, caches GATT discovery results, and transparently retries
//! unexpectedly dropped links with bounded exponential backoff.
//!
//! The flow is: implement [`adapter::HostAdapter`] for the platform stack
//! (or enable the `bluest` feature for the built-in one), hand it to
//! [`session::spawn`] together with the adapter-event channel, then route
//! bridge calls through [`bridge::dispatch`] and forward events from
//! [`session::BleHandle::events`] to listeners.

pub mod adapter;
pub mod bridge;
pub mod encoding;
pub mod error;
pub mod events;
pub mod session;
pub mod types;

pub use adapter::{AdapterEvent, HostAdapter};
pub use bridge::{BridgeResponse, dispatch};
pub use error::{BleError, Result};
pub use events::BridgeEvent;
pub use session::{BleHandle, spawn};
