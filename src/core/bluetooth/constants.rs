//! Constants used throughout the manager core
//! This module contains the constant values shared by the core and the backends,
//! such as the Bluetooth base UUID, default names and timeouts.

use uuid::Uuid;

/// Name reported for peripherals that do not advertise one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// The Bluetooth base UUID that 16-bit and 32-bit short forms expand against
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Bounded wait for Connecting -> Connected, in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Bounded wait for Disconnecting -> Disconnected, in milliseconds
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 5_000;

/// Interval of the pull-based reconciliation against the OS connected-device list
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;
