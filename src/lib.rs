//! BLE central manager library
//! Scanning, connection management and GATT access over a single ordered
//! event stream.

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

pub use crate::core::bluetooth::{BleError, BleEvent, BleManager, BluestTransport, Device};
