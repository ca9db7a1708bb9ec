use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_RECONCILE_INTERVAL_MS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Bounded wait for a connection attempt to be confirmed by the native stack.
    /// On expiry the device returns to Disconnected and an error is emitted.
    pub connect_timeout_ms: u64,

    /// Bounded wait for the native ack of a disconnect.
    /// On expiry the device is forced to Disconnected.
    pub disconnect_timeout_ms: u64,

    /// Interval of the pull-based reconciliation against the list of
    /// peripherals the OS already holds connections to. 0 disables it.
    pub reconcile_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
        }
    }
}

impl ManagerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_ms > 0).then(|| Duration::from_millis(self.reconcile_interval_ms))
    }
}
