//! Event dispatching
//! Everything that can change core state (facade requests, native callbacks,
//! expired timers) enters one ordered inbound queue. The manager task drains it
//! and hands the resulting events to the registered sink one at a time.

use log::{debug, error};
use tokio::sync::mpsc;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::manager::Request;
use crate::core::bluetooth::native::NativeEvent;
use crate::core::bluetooth::types::BleEvent;

/// Messages on the manager's inbound queue.
pub(crate) enum Inbound<H> {
    Request(Request),
    Native(NativeEvent<H>),
    /// A bounded wait armed for `generation` on `address` ran out.
    Expired { address: String, generation: u64 },
}

/// Consumer-facing callback.
///
/// Invoked from the manager task only, never concurrently with another event
/// or with the processing of a facade request, so implementations may mutate
/// state they own without locking.
pub trait EventSink: Send + 'static {
    fn on_event(&mut self, event: BleEvent);
}

impl<F> EventSink for F
where
    F: FnMut(BleEvent) + Send + 'static,
{
    fn on_event(&mut self, event: BleEvent) {
        self(event)
    }
}

/// Forwards events to a channel, for consumers that prefer to poll.
impl EventSink for mpsc::UnboundedSender<BleEvent> {
    fn on_event(&mut self, event: BleEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Holds the single active sink.
#[derive(Default)]
pub struct Dispatcher {
    sink: Option<Box<dyn EventSink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any prior sink. `None` unregisters; later events are dropped.
    pub fn set_sink(&mut self, sink: Option<Box<dyn EventSink>>) {
        self.sink = sink;
    }

    pub fn emit(&mut self, event: BleEvent) {
        match self.sink.as_mut() {
            Some(sink) => sink.on_event(event),
            None => debug!("No callback registered, dropping {:?}", event),
        }
    }

    pub fn emit_error(&mut self, err: &BleError) {
        error!("{}", err);
        self.emit(BleEvent::Error {
            message: err.to_string(),
        });
    }
}
