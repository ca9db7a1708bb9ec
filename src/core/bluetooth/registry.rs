//! Identity registry: the single source of truth for which native peripheral
//! an address refers to within the current scan session.

use std::collections::HashMap;

use crate::core::bluetooth::error::{BleError, Result};

/// Advertised attributes tracked alongside a handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Outcome of registering a discovered peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First sighting in this session.
    New,
    /// Known peripheral whose attributes changed.
    Updated,
    /// Known peripheral, nothing changed.
    Unchanged,
}

struct Entry<H> {
    handle: H,
    info: PeripheralInfo,
}

/// Maps `address -> native handle` for one scan session.
pub struct IdentityRegistry<H> {
    entries: HashMap<String, Entry<H>>,
}

impl<H: Clone> IdentityRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers or refreshes a peripheral under `address`.
    ///
    /// Idempotent per physical peripheral: the stored handle is replaced by the
    /// latest native object, attributes missing from a sighting keep their last
    /// known value, and no second entry is ever created for the same address.
    pub fn register(&mut self, address: &str, handle: H, info: PeripheralInfo) -> Registration {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.handle = handle;
                let merged = PeripheralInfo {
                    name: info.name.or_else(|| entry.info.name.clone()),
                    rssi: info.rssi.or(entry.info.rssi),
                };
                if merged == entry.info {
                    Registration::Unchanged
                } else {
                    entry.info = merged;
                    Registration::Updated
                }
            }
            None => {
                self.entries
                    .insert(address.to_string(), Entry { handle, info });
                Registration::New
            }
        }
    }

    /// Returns the native handle for `address`, never guessing.
    pub fn resolve(&self, address: &str) -> Result<H> {
        self.entries
            .get(address)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| BleError::DeviceNotFound(address.to_string()))
    }

    pub fn info(&self, address: &str) -> Option<&PeripheralInfo> {
        self.entries.get(address).map(|entry| &entry.info)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Invalidates every address of the previous session.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<H: Clone> Default for IdentityRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
