//! Connection state tracking
//! Per-address state machine: Disconnected -> Connecting -> Connected ->
//! Disconnecting -> Disconnected, with operation gating and bounded waits.

use std::collections::HashMap;

use log::debug;

use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::types::ConnectionState;

/// Result of a `connect()` request against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// Already connected: no-op success, no event.
    AlreadyConnected,
    /// Moved to `Connecting`; the generation identifies this attempt's timer.
    Started(u64),
}

/// Result of a `disconnect()` request against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStep {
    /// Already disconnected: no-op success, no event.
    AlreadyDisconnected,
    /// A disconnect is already waiting for its native ack.
    InProgress,
    /// Moved to `Disconnecting` from the given state.
    Started {
        from: ConnectionState,
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: ConnectionState,
    generation: u64,
}

/// Connection state machine for every known address.
///
/// Addresses without an entry are `Disconnected`.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    states: HashMap<String, Tracked>,
    next_generation: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, address: &str) -> ConnectionState {
        self.states
            .get(address)
            .map(|tracked| tracked.state)
            .unwrap_or_default()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state(address) == ConnectionState::Connected
    }

    /// Gate for GATT operations.
    pub fn require_connected(&self, address: &str) -> Result<()> {
        if self.is_connected(address) {
            Ok(())
        } else {
            Err(BleError::NotConnected(address.to_string()))
        }
    }

    pub fn begin_connect(&mut self, address: &str) -> Result<ConnectStep> {
        match self.state(address) {
            ConnectionState::Disconnected => {
                let generation = self.enter(address, ConnectionState::Connecting);
                Ok(ConnectStep::Started(generation))
            }
            ConnectionState::Connected => Ok(ConnectStep::AlreadyConnected),
            state => Err(BleError::InvalidState {
                address: address.to_string(),
                state,
            }),
        }
    }

    pub fn begin_disconnect(&mut self, address: &str) -> DisconnectStep {
        match self.state(address) {
            ConnectionState::Disconnected => DisconnectStep::AlreadyDisconnected,
            ConnectionState::Disconnecting => DisconnectStep::InProgress,
            from => {
                let generation = self.enter(address, ConnectionState::Disconnecting);
                DisconnectStep::Started { from, generation }
            }
        }
    }

    /// Native success for a connection attempt. Returns the prior state;
    /// only `Connecting` moves to `Connected`.
    pub fn on_connected(&mut self, address: &str) -> ConnectionState {
        let prior = self.state(address);
        if prior == ConnectionState::Connecting {
            self.enter(address, ConnectionState::Connected);
        } else {
            debug!("Ignoring native connect for {} in state {:?}", address, prior);
        }
        prior
    }

    /// Native failure for a connection attempt. True if an attempt was aborted.
    pub fn on_connect_failed(&mut self, address: &str) -> bool {
        if self.state(address) == ConnectionState::Connecting {
            self.states.remove(address);
            true
        } else {
            false
        }
    }

    /// Native disconnect, either an ack or spontaneous. Returns the prior state.
    pub fn on_disconnected(&mut self, address: &str) -> ConnectionState {
        self.states
            .remove(address)
            .map(|tracked| tracked.state)
            .unwrap_or_default()
    }

    /// Bounded-wait expiry. Forces `Disconnected` and returns the prior state
    /// if the address is still in the transient state the timer was armed for.
    pub fn expire(&mut self, address: &str, generation: u64) -> Option<ConnectionState> {
        let tracked = *self.states.get(address)?;
        let transient = matches!(
            tracked.state,
            ConnectionState::Connecting | ConnectionState::Disconnecting
        );
        if tracked.generation != generation || !transient {
            return None;
        }
        self.states.remove(address);
        Some(tracked.state)
    }

    /// Drops every tracked connection, returning the live ones.
    pub fn reset(&mut self) -> Vec<(String, ConnectionState)> {
        self.states
            .drain()
            .map(|(address, tracked)| (address, tracked.state))
            .collect()
    }

    fn enter(&mut self, address: &str, state: ConnectionState) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.states
            .insert(address.to_string(), Tracked { state, generation });
        generation
    }
}
