//! Application state management
//! Everything the binary needs after startup: the manager running over the
//! system adapter.

use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{BleManager, BluestTransport};

pub struct AppState {
    pub manager: BleManager<BluestTransport>,
}

impl AppState {
    /// Builds the state from a loaded config. Must run inside a Tokio runtime.
    pub fn new(config: &AppConfig) -> Self {
        info!("Initializing Bluetooth manager...");
        let manager = BluestTransport::manager(config.manager.clone());
        Self { manager }
    }
}
