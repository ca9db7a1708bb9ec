//! Native event source
//! The seam between the manager core and a platform binding. A binding
//! implements [`NativeTransport`] to issue requests and reports everything the
//! platform tells it through [`NativeEvents`], which forwards tagged events
//! into the manager's single ordered inbound queue.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::dispatcher::Inbound;
use crate::core::bluetooth::error::Result;
use crate::core::bluetooth::types::{RequestId, ServiceMap};

/// Platform binding driven by the manager core.
///
/// Every request method returns as soon as the request has been handed to the
/// platform. An `Err` means it could not be issued at all; the outcome of an
/// issued request is reported later through the supplied [`NativeEvents`].
/// GATT completions must echo the `request` id they were issued with.
#[async_trait]
pub trait NativeTransport: Send + Sync + 'static {
    /// Opaque native peripheral reference. Never leaves the manager core.
    type Handle: Clone + fmt::Debug + Send + Sync + 'static;

    /// Stable address string for a handle.
    fn address_of(&self, handle: &Self::Handle) -> String;

    /// Starts (or restarts) discovery. Must not duplicate an active scan.
    async fn start_scan(&self, events: NativeEvents<Self::Handle>) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Connects and discovers services, answering with `on_connected` then
    /// `on_services_discovered`, or with `on_connect_failed`.
    async fn connect(&self, handle: &Self::Handle, events: NativeEvents<Self::Handle>)
    -> Result<()>;

    /// Disconnects (or aborts a pending connection), acked by `on_disconnected`.
    async fn disconnect(
        &self,
        handle: &Self::Handle,
        events: NativeEvents<Self::Handle>,
    ) -> Result<()>;

    async fn read(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        events: NativeEvents<Self::Handle>,
    ) -> Result<()>;

    async fn write(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        request: RequestId,
        events: NativeEvents<Self::Handle>,
    ) -> Result<()>;

    async fn set_notify(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        request: RequestId,
        events: NativeEvents<Self::Handle>,
    ) -> Result<()>;
}

/// One native callback, as a tagged variant.
#[derive(Debug, Clone)]
pub enum NativeEvent<H> {
    Discovered {
        handle: H,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Connected {
        handle: H,
    },
    ConnectFailed {
        handle: H,
        reason: String,
    },
    Disconnected {
        handle: H,
    },
    ServicesDiscovered {
        handle: H,
        services: ServiceMap,
    },
    CharacteristicChanged {
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ReadResult {
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        result: std::result::Result<Vec<u8>, String>,
    },
    WriteResult {
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        result: std::result::Result<(), String>,
    },
    NotifyResult {
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
        request: RequestId,
        result: std::result::Result<(), String>,
    },
    ScanFailed {
        reason: String,
    },
}

/// Thread-safe forwarding handle given to platform bindings.
///
/// Posting never blocks and may happen from any thread. Once the manager has
/// stopped, posts are dropped silently.
pub struct NativeEvents<H> {
    inbox: mpsc::UnboundedSender<Inbound<H>>,
}

impl<H> Clone for NativeEvents<H> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
        }
    }
}

impl<H> fmt::Debug for NativeEvents<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEvents")
            .field("closed", &self.inbox.is_closed())
            .finish()
    }
}

impl<H> NativeEvents<H> {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<Inbound<H>>) -> Self {
        Self { inbox }
    }

    /// True once the manager is gone; long-running binding tasks should stop.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    pub fn post(&self, event: NativeEvent<H>) {
        if self.inbox.send(Inbound::Native(event)).is_err() {
            debug!("Manager stopped, dropping native event");
        }
    }

    pub fn on_discovered(&self, handle: H, name: Option<String>, rssi: Option<i16>) {
        self.post(NativeEvent::Discovered { handle, name, rssi });
    }

    pub fn on_connected(&self, handle: H) {
        self.post(NativeEvent::Connected { handle });
    }

    pub fn on_connect_failed(&self, handle: H, reason: impl Into<String>) {
        self.post(NativeEvent::ConnectFailed {
            handle,
            reason: reason.into(),
        });
    }

    pub fn on_disconnected(&self, handle: H) {
        self.post(NativeEvent::Disconnected { handle });
    }

    pub fn on_services_discovered(&self, handle: H, services: ServiceMap) {
        self.post(NativeEvent::ServicesDiscovered { handle, services });
    }

    pub fn on_characteristic_changed(
        &self,
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        self.post(NativeEvent::CharacteristicChanged {
            handle,
            service,
            characteristic,
            value,
        });
    }

    pub fn on_read_result(
        &self,
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        result: std::result::Result<Vec<u8>, String>,
    ) {
        self.post(NativeEvent::ReadResult {
            handle,
            service,
            characteristic,
            request,
            result,
        });
    }

    pub fn on_write_result(
        &self,
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        result: std::result::Result<(), String>,
    ) {
        self.post(NativeEvent::WriteResult {
            handle,
            service,
            characteristic,
            request,
            result,
        });
    }

    pub fn on_notify_result(
        &self,
        handle: H,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
        request: RequestId,
        result: std::result::Result<(), String>,
    ) {
        self.post(NativeEvent::NotifyResult {
            handle,
            service,
            characteristic,
            enabled,
            request,
            result,
        });
    }

    pub fn on_scan_failed(&self, reason: impl Into<String>) {
        self.post(NativeEvent::ScanFailed {
            reason: reason.into(),
        });
    }
}

/// One entry of a pull-based discovery snapshot.
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral<H> {
    pub handle: H,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Pull-based discovery: periodically reconciles a snapshot list through
/// `on_discovered`. The identity registry turns unchanged entries into no-ops,
/// so the resulting events match push-based discovery.
pub fn spawn_polling_discovery<H, F, Fut>(
    interval: Duration,
    events: NativeEvents<H>,
    cancel: CancellationToken,
    mut snapshot: F,
) -> JoinHandle<()>
where
    H: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<DiscoveredPeripheral<H>>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if events.is_closed() {
                        break;
                    }
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = snapshot() => result,
                    };
                    match result {
                        Ok(peripherals) => {
                            for peripheral in peripherals {
                                events.on_discovered(peripheral.handle, peripheral.name, peripheral.rssi);
                            }
                        }
                        Err(e) => warn!("Discovery snapshot failed: {}", e),
                    }
                }
            }
        }
        debug!("Polling discovery stopped");
    })
}
