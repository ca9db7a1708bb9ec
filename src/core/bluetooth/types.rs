//! Defines shared data structures for the Bluetooth module.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::UNKNOWN_DEVICE_NAME;

/// Discovered GATT layout of a connected peripheral: service -> characteristics.
pub type ServiceMap = HashMap<Uuid, HashSet<Uuid>>;

/// Immutable snapshot of a discovered peripheral.
///
/// Every change produces a new value under the same address; snapshots are
/// never mutated in place after they have been handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Platform-supplied name, or "Unknown"
    pub name: String,
    /// The only stable identifier, derived from the native handle
    pub address: String,
    /// Last known signal strength in dBm
    pub rssi: Option<i16>,
    /// True iff the connection state is `Connected`
    pub is_connected: bool,
}

impl Device {
    /// Creates a new Device snapshot
    pub fn new(name: Option<&str>, address: &str, rssi: Option<i16>, is_connected: bool) -> Self {
        Self {
            name: name.unwrap_or(UNKNOWN_DEVICE_NAME).to_string(),
            address: address.to_string(),
            rssi,
            is_connected,
        }
    }
}

/// Identifies one issued GATT request; native completions echo it back.
pub type RequestId = u64;

/// Per-address connection state. Absent addresses are `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Kind of GATT request that can be pending against a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    Read,
    Write,
    Notify,
}

/// Events delivered to the registered sink, one at a time and in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BleEvent {
    /// A peripheral was discovered, or its attributes (name, RSSI) changed.
    DeviceFound { device: Device },
    DeviceConnected { device: Device },
    DeviceDisconnected { device: Device },
    /// A read completed or a subscribed characteristic notified a new value.
    CharacteristicRead {
        device: Device,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The native stack confirmed a write.
    CharacteristicWrite {
        device: Device,
        service: Uuid,
        characteristic: Uuid,
    },
    Error { message: String },
}
