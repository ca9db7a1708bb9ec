//! Bluetooth manager core
//! This module owns peripheral identity, connection state and GATT routing,
//! and turns native callbacks into one ordered stream of events.

mod bluest_transport;
mod connection;
mod constants;
mod dispatcher;
mod error;
mod gatt;
mod manager;
mod native;
mod notification;
mod registry;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use connection::{ConnectStep, ConnectionTracker, DisconnectStep};
pub use constants::*; // Re-export all constants
pub use dispatcher::{Dispatcher, EventSink};
pub use error::{BleError, Result};
pub use gatt::{GattRouter, PendingKey};
pub use manager::BleManager;
pub use native::{
    spawn_polling_discovery, DiscoveredPeripheral, NativeEvent, NativeEvents, NativeTransport,
};
pub use registry::{IdentityRegistry, PeripheralInfo, Registration};
pub use types::{BleEvent, ConnectionState, Device, OperationKind, RequestId, ServiceMap};
