//! GATT operation routing
//! Resolves (service, characteristic) pairs against a connected peripheral's
//! discovered layout and tracks the requests in flight so that native
//! completions can be matched back to the request that caused them.

use std::collections::HashMap;

use uuid::Uuid;

use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::types::{OperationKind, RequestId, ServiceMap};

/// Identifies one in-flight GATT request. At most one per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub address: String,
    pub characteristic: Uuid,
    pub kind: OperationKind,
}

impl PendingKey {
    pub fn new(address: &str, characteristic: Uuid, kind: OperationKind) -> Self {
        Self {
            address: address.to_string(),
            characteristic,
            kind,
        }
    }
}

/// Discovered descriptors and pending operations for all connected peripherals.
///
/// Each pending operation carries the id of the request that started it; the
/// native completion must echo that id to be accepted.
#[derive(Debug, Default)]
pub struct GattRouter {
    services: HashMap<String, ServiceMap>,
    pending: HashMap<PendingKey, RequestId>,
    last_request: RequestId,
}

impl GattRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a discovery result into the peripheral's layout.
    pub fn set_services(&mut self, address: &str, discovered: ServiceMap) {
        let layout = self.services.entry(address.to_string()).or_default();
        for (service, characteristics) in discovered {
            layout.entry(service).or_default().extend(characteristics);
        }
    }

    /// Ensures the pair exists in the discovered layout.
    pub fn require_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let found = self
            .services
            .get(address)
            .and_then(|layout| layout.get(&service))
            .is_some_and(|characteristics| characteristics.contains(&characteristic));
        if found {
            Ok(())
        } else {
            Err(BleError::CharacteristicNotFound {
                service,
                characteristic,
            })
        }
    }

    /// Registers a pending operation, failing fast on a duplicate. Returns the
    /// id the native layer must report the completion with.
    pub fn begin(&mut self, key: PendingKey) -> Result<RequestId> {
        if self.pending.contains_key(&key) {
            return Err(BleError::OperationInProgress {
                address: key.address,
                characteristic: key.characteristic,
                kind: key.kind,
            });
        }
        self.last_request += 1;
        self.pending.insert(key, self.last_request);
        Ok(self.last_request)
    }

    /// Resolves a pending operation. False means the completion is late,
    /// belongs to an earlier request, or is unsolicited, and must be dropped.
    pub fn complete(&mut self, key: &PendingKey, request: RequestId) -> bool {
        if self.pending.get(key) == Some(&request) {
            self.pending.remove(key);
            true
        } else {
            false
        }
    }

    /// Drops the layout and every pending operation of a torn-down peripheral.
    pub fn clear_device(&mut self, address: &str) {
        self.services.remove(address);
        self.pending.retain(|key, _| key.address != address);
    }

    pub fn reset(&mut self) {
        self.services.clear();
        self.pending.clear();
    }
}
