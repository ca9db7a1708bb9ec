//! Error taxonomy for the manager core.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::{ConnectionState, OperationKind};

/// Every failure a facade operation can report.
///
/// All of these are caught at the facade boundary and turned into an
/// `Error` event; none of them terminate the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// The address is not a key of the identity registry.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The operation is not valid for the device's connection state.
    #[error("Invalid state for {address}: {state:?}")]
    InvalidState {
        address: String,
        state: ConnectionState,
    },

    /// A GATT operation was issued against a device that is not connected.
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// The service/characteristic pair was not discovered on the device.
    #[error("Characteristic not found: {characteristic} (service {service})")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// The same GATT operation is already in flight for this characteristic.
    #[error("{kind:?} already in progress for {characteristic} on {address}")]
    OperationInProgress {
        address: String,
        characteristic: Uuid,
        kind: OperationKind,
    },

    /// The native stack could not be initialised or is not present.
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The native stack reported an error for a request.
    #[error("Native Bluetooth failure: {0}")]
    NativeFailure(String),

    /// A malformed address or UUID was passed to a facade operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded wait expired before the native stack answered.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The manager's event-processing task is no longer running.
    #[error("Bluetooth manager has stopped")]
    ManagerStopped,
}

impl From<bluest::Error> for BleError {
    fn from(e: bluest::Error) -> Self {
        BleError::NativeFailure(e.to_string())
    }
}

pub type Result<T, E = BleError> = std::result::Result<T, E>;
