//! Core functionality for the BLE central manager

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BleError, BleEvent, BleManager, BluestTransport, Device};
