//! Bluetooth manager
//! This module provides the public operation surface and the task that owns
//! all mutable core state. Facade calls, native callbacks and expired timers
//! are processed one at a time from a single inbound queue, so registry,
//! connection and GATT state are only ever touched from that task and every
//! event reaches the sink in the order it was produced.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::manager_config::ManagerConfig;
use crate::core::bluetooth::connection::{ConnectStep, ConnectionTracker, DisconnectStep};
use crate::core::bluetooth::dispatcher::{Dispatcher, EventSink, Inbound};
use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::gatt::{GattRouter, PendingKey};
use crate::core::bluetooth::native::{NativeEvent, NativeEvents, NativeTransport};
use crate::core::bluetooth::registry::{IdentityRegistry, PeripheralInfo, Registration};
use crate::core::bluetooth::types::{BleEvent, ConnectionState, Device, OperationKind, RequestId};
use crate::utils::{parse_uuid, validate_address};

type Reply = oneshot::Sender<Result<()>>;

/// Facade requests as they travel through the inbound queue.
pub(crate) enum Request {
    SetCallback(Option<Box<dyn EventSink>>, oneshot::Sender<()>),
    StartScan(Reply),
    StopScan(Reply),
    Connect(String, Reply),
    Disconnect(String, Reply),
    Read {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        reply: Reply,
    },
    Write {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply,
    },
    Notify {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        reply: Reply,
    },
    /// Facade-side validation failure, reported in order with other events.
    Reject(BleError),
    Devices(oneshot::Sender<Vec<Device>>),
    State(String, oneshot::Sender<Result<ConnectionState>>),
    Shutdown(oneshot::Sender<()>),
}

/// Public operation surface.
///
/// Every operation returns once the native request has been issued;
/// completion is signalled later through an event. Failures are both
/// returned and emitted as `BleEvent::Error`.
pub struct BleManager<T: NativeTransport> {
    inbox: mpsc::UnboundedSender<Inbound<T::Handle>>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: NativeTransport> Clone for BleManager<T> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            _transport: PhantomData,
        }
    }
}

impl<T: NativeTransport> BleManager<T> {
    /// Creates a manager over `transport` and spawns its processing task.
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: T, config: ManagerConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let actor = ManagerActor {
            transport,
            config,
            inbox: inbox_rx,
            loopback: inbox_tx.downgrade(),
            registry: IdentityRegistry::new(),
            tracker: ConnectionTracker::new(),
            router: GattRouter::new(),
            dispatcher: Dispatcher::new(),
            scanning: false,
            releasing: HashMap::new(),
        };
        tokio::spawn(actor.run());
        Self {
            inbox: inbox_tx,
            _transport: PhantomData,
        }
    }

    /// Registers the event sink, replacing any prior one. `None` unregisters.
    pub async fn set_callback(&self, callback: Option<Box<dyn EventSink>>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::SetCallback(callback, tx))?;
        rx.await.map_err(|_| BleError::ManagerStopped)
    }

    /// Registers a channel sink and returns its receiving end.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BleEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_callback(Some(Box::new(tx))).await?;
        Ok(rx)
    }

    /// Starts a new scan session. Restarts an active scan instead of
    /// duplicating it; every prior address becomes invalid.
    pub async fn start_scan(&self) -> Result<()> {
        self.call(Request::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.call(Request::StopScan).await
    }

    pub async fn connect(&self, address: &str) -> Result<()> {
        if let Err(e) = validate_address(address) {
            return self.reject(e);
        }
        let address = address.to_string();
        self.call(|reply| Request::Connect(address, reply)).await
    }

    pub async fn disconnect(&self, address: &str) -> Result<()> {
        if let Err(e) = validate_address(address) {
            return self.reject(e);
        }
        let address = address.to_string();
        self.call(|reply| Request::Disconnect(address, reply)).await
    }

    pub async fn read_characteristic(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<()> {
        let (service, characteristic) = match Self::validate_gatt(address, service, characteristic)
        {
            Ok(uuids) => uuids,
            Err(e) => return self.reject(e),
        };
        let address = address.to_string();
        self.call(|reply| Request::Read {
            address,
            service,
            characteristic,
            reply,
        })
        .await
    }

    pub async fn write_characteristic(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let (service, characteristic) = match Self::validate_gatt(address, service, characteristic)
        {
            Ok(uuids) => uuids,
            Err(e) => return self.reject(e),
        };
        let address = address.to_string();
        self.call(|reply| Request::Write {
            address,
            service,
            characteristic,
            value,
            reply,
        })
        .await
    }

    /// Toggles a subscription. There is no completion event; failures still
    /// surface as `BleEvent::Error`.
    pub async fn notify_characteristic(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        enable: bool,
    ) -> Result<()> {
        let (service, characteristic) = match Self::validate_gatt(address, service, characteristic)
        {
            Ok(uuids) => uuids,
            Err(e) => return self.reject(e),
        };
        let address = address.to_string();
        self.call(|reply| Request::Notify {
            address,
            service,
            characteristic,
            enable,
            reply,
        })
        .await
    }

    /// Snapshots of every peripheral in the current scan session.
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Devices(tx))?;
        rx.await.map_err(|_| BleError::ManagerStopped)
    }

    pub async fn connection_state(&self, address: &str) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::State(address.to_string(), tx))?;
        rx.await.map_err(|_| BleError::ManagerStopped)?
    }

    /// Stops scanning, disconnects every live peripheral and ends the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Shutdown(tx))?;
        rx.await.map_err(|_| BleError::ManagerStopped)
    }

    fn validate_gatt(address: &str, service: &str, characteristic: &str) -> Result<(Uuid, Uuid)> {
        validate_address(address)?;
        Ok((parse_uuid(service)?, parse_uuid(characteristic)?))
    }

    fn send(&self, request: Request) -> Result<()> {
        self.inbox
            .send(Inbound::Request(request))
            .map_err(|_| BleError::ManagerStopped)
    }

    async fn call(&self, build: impl FnOnce(Reply) -> Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| BleError::ManagerStopped)?
    }

    fn reject(&self, err: BleError) -> Result<()> {
        // Best effort: the error event is lost only if the task is already gone.
        let _ = self.send(Request::Reject(err.clone()));
        Err(err)
    }
}

struct ManagerActor<T: NativeTransport> {
    transport: T,
    config: ManagerConfig,
    inbox: mpsc::UnboundedReceiver<Inbound<T::Handle>>,
    loopback: mpsc::WeakUnboundedSender<Inbound<T::Handle>>,
    registry: IdentityRegistry<T::Handle>,
    tracker: ConnectionTracker,
    router: GattRouter,
    dispatcher: Dispatcher,
    scanning: bool,
    /// Native disconnect acks still owed for handles released without a
    /// state transition of their own.
    releasing: HashMap<String, u32>,
}

impl<T: NativeTransport> ManagerActor<T> {
    async fn run(mut self) {
        info!("Bluetooth manager started");
        while let Some(message) = self.inbox.recv().await {
            match message {
                Inbound::Request(request) => {
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Inbound::Native(event) => self.handle_native(event).await,
                Inbound::Expired {
                    address,
                    generation,
                } => self.handle_expired(address, generation).await,
            }
        }
        info!("Bluetooth manager stopped");
    }

    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::SetCallback(sink, reply) => {
                self.dispatcher.set_sink(sink);
                let _ = reply.send(());
            }
            Request::StartScan(reply) => {
                let result = self.start_scan().await;
                self.finish(reply, result);
            }
            Request::StopScan(reply) => {
                let result = self.stop_scan().await;
                self.finish(reply, result);
            }
            Request::Connect(address, reply) => {
                let result = self.connect(&address).await;
                self.finish(reply, result);
            }
            Request::Disconnect(address, reply) => {
                let result = self.disconnect(&address).await;
                self.finish(reply, result);
            }
            Request::Read {
                address,
                service,
                characteristic,
                reply,
            } => {
                let result = self.read(&address, service, characteristic).await;
                self.finish(reply, result);
            }
            Request::Write {
                address,
                service,
                characteristic,
                value,
                reply,
            } => {
                let result = self.write(&address, service, characteristic, value).await;
                self.finish(reply, result);
            }
            Request::Notify {
                address,
                service,
                characteristic,
                enable,
                reply,
            } => {
                let result = self.notify(&address, service, characteristic, enable).await;
                self.finish(reply, result);
            }
            Request::Reject(err) => self.dispatcher.emit_error(&err),
            Request::Devices(reply) => {
                let mut devices: Vec<Device> = self
                    .registry
                    .addresses()
                    .map(|address| self.snapshot(address))
                    .collect();
                devices.sort_by(|a, b| a.address.cmp(&b.address));
                let _ = reply.send(devices);
            }
            Request::State(address, reply) => {
                let state = if self.registry.contains(&address) {
                    Ok(self.tracker.state(&address))
                } else {
                    Err(BleError::DeviceNotFound(address))
                };
                let _ = reply.send(state);
            }
            Request::Shutdown(reply) => {
                if let Err(e) = self.stop_scan().await {
                    warn!("Failed to stop scan during shutdown: {}", e);
                }
                self.reset_session().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Converts a failed request into an `Error` event and answers the caller.
    fn finish(&mut self, reply: Reply, result: Result<()>) {
        if let Err(e) = &result {
            self.dispatcher.emit_error(e);
        }
        let _ = reply.send(result);
    }

    async fn start_scan(&mut self) -> Result<()> {
        let events = self.events()?;
        if self.scanning {
            info!("Scan already running, restarting it.");
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop previous scan: {}", e);
            }
            self.scanning = false;
        }
        self.reset_session().await;

        self.transport.start_scan(events).await?;
        self.scanning = true;
        info!("Scan session started.");
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.scanning {
            debug!("No active scan to stop.");
            return Ok(());
        }
        self.scanning = false;
        self.transport.stop_scan().await?;
        info!("Scan stopped.");
        Ok(())
    }

    /// Tears down every live connection and invalidates all addresses.
    async fn reset_session(&mut self) {
        for (address, state) in self.tracker.reset() {
            if let Ok(handle) = self.registry.resolve(&address) {
                self.release(&handle).await;
            }
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                let device = self.snapshot(&address);
                self.dispatcher.emit(BleEvent::DeviceDisconnected { device });
            } else {
                info!("Abandoned connection attempt to {}", address);
            }
        }
        self.router.reset();
        self.registry.clear();
    }

    async fn connect(&mut self, address: &str) -> Result<()> {
        let events = self.events()?;
        let handle = self.registry.resolve(address)?;
        match self.tracker.begin_connect(address)? {
            ConnectStep::AlreadyConnected => {
                debug!("Device {} already connected.", address);
                Ok(())
            }
            ConnectStep::Started(generation) => {
                info!("Initiating connection to {}...", address);
                if let Err(e) = self.transport.connect(&handle, events).await {
                    self.tracker.on_connect_failed(address);
                    return Err(e);
                }
                self.arm_timer(address, generation, self.config.connect_timeout());
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self, address: &str) -> Result<()> {
        let events = self.events()?;
        let handle = self.registry.resolve(address)?;
        match self.tracker.begin_disconnect(address) {
            DisconnectStep::AlreadyDisconnected | DisconnectStep::InProgress => {
                debug!("Device {} is not connected.", address);
                Ok(())
            }
            DisconnectStep::Started { from, generation } => {
                info!("Disconnecting from {} ({:?})", address, from);
                // Completions still in flight are dropped from here on.
                self.router.clear_device(address);
                // If the request cannot be issued the bounded wait settles the state.
                self.arm_timer(address, generation, self.config.disconnect_timeout());
                self.transport.disconnect(&handle, events).await
            }
        }
    }

    async fn read(&mut self, address: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
        let events = self.events()?;
        let (handle, key, request) =
            self.begin_gatt(address, service, characteristic, OperationKind::Read)?;
        let issued = self
            .transport
            .read(&handle, service, characteristic, request, events)
            .await;
        self.settle_issue(&key, request, issued)
    }

    async fn write(
        &mut self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        let events = self.events()?;
        let (handle, key, request) =
            self.begin_gatt(address, service, characteristic, OperationKind::Write)?;
        let issued = self
            .transport
            .write(&handle, service, characteristic, value, request, events)
            .await;
        self.settle_issue(&key, request, issued)
    }

    async fn notify(
        &mut self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        let events = self.events()?;
        let (handle, key, request) =
            self.begin_gatt(address, service, characteristic, OperationKind::Notify)?;
        let issued = self
            .transport
            .set_notify(&handle, service, characteristic, enable, request, events)
            .await;
        self.settle_issue(&key, request, issued)
    }

    /// Checks, in order: known address, connected, discovered pair, not pending.
    fn begin_gatt(
        &mut self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        kind: OperationKind,
    ) -> Result<(T::Handle, PendingKey, RequestId)> {
        let handle = self.registry.resolve(address)?;
        self.tracker.require_connected(address)?;
        self.router
            .require_characteristic(address, service, characteristic)?;
        let key = PendingKey::new(address, characteristic, kind);
        let request = self.router.begin(key.clone())?;
        Ok((handle, key, request))
    }

    fn settle_issue(
        &mut self,
        key: &PendingKey,
        request: RequestId,
        issued: Result<()>,
    ) -> Result<()> {
        if issued.is_err() {
            self.router.complete(key, request);
        }
        issued
    }

    async fn handle_native(&mut self, event: NativeEvent<T::Handle>) {
        match event {
            NativeEvent::Discovered { handle, name, rssi } => {
                if !self.scanning {
                    debug!("Dropping discovery outside a scan session: {:?}", handle);
                    return;
                }
                let address = self.transport.address_of(&handle);
                match self
                    .registry
                    .register(&address, handle, PeripheralInfo { name, rssi })
                {
                    Registration::New | Registration::Updated => {
                        let device = self.snapshot(&address);
                        debug!("Device found: {:?}", device);
                        self.dispatcher.emit(BleEvent::DeviceFound { device });
                    }
                    Registration::Unchanged => {}
                }
            }
            NativeEvent::Connected { handle } => {
                let Some(address) = self.known_address(&handle) else {
                    return;
                };
                match self.tracker.on_connected(&address) {
                    ConnectionState::Connecting => {
                        info!("Device {} connected.", address);
                        let device = self.snapshot(&address);
                        self.dispatcher.emit(BleEvent::DeviceConnected { device });
                    }
                    ConnectionState::Disconnected => {
                        warn!("Late connection to {}, releasing it.", address);
                        self.release(&handle).await;
                    }
                    _ => {}
                }
            }
            NativeEvent::ConnectFailed { handle, reason } => {
                let Some(address) = self.known_address(&handle) else {
                    return;
                };
                if self.tracker.on_connect_failed(&address) {
                    self.router.clear_device(&address);
                    self.dispatcher.emit_error(&BleError::NativeFailure(format!(
                        "Failed to connect to {}: {}",
                        address, reason
                    )));
                }
            }
            NativeEvent::Disconnected { handle } => {
                if self.absorb_release_ack(&handle) {
                    return;
                }
                let Some(address) = self.known_address(&handle) else {
                    return;
                };
                let prior = self.tracker.on_disconnected(&address);
                self.router.clear_device(&address);
                match prior {
                    ConnectionState::Connected | ConnectionState::Disconnecting => {
                        info!("Device {} disconnected.", address);
                        let device = self.snapshot(&address);
                        self.dispatcher
                            .emit(BleEvent::DeviceDisconnected { device });
                    }
                    ConnectionState::Connecting => {
                        self.dispatcher.emit_error(&BleError::NativeFailure(format!(
                            "Connection to {} was lost before it completed",
                            address
                        )));
                    }
                    ConnectionState::Disconnected => {
                        debug!("Disconnect for {} already handled.", address);
                    }
                }
            }
            NativeEvent::ServicesDiscovered { handle, services } => {
                let Some(address) = self.known_address(&handle) else {
                    return;
                };
                if self.tracker.is_connected(&address) {
                    debug!("Discovered {} services on {}", services.len(), address);
                    self.router.set_services(&address, services);
                } else {
                    debug!("Dropping service discovery for unconnected {}", address);
                }
            }
            NativeEvent::CharacteristicChanged {
                handle,
                service,
                characteristic,
                value,
            } => {
                let Some(address) = self.known_address(&handle) else {
                    return;
                };
                if self.tracker.is_connected(&address) {
                    let device = self.snapshot(&address);
                    self.dispatcher.emit(BleEvent::CharacteristicRead {
                        device,
                        service,
                        characteristic,
                        value,
                    });
                }
            }
            NativeEvent::ReadResult {
                handle,
                service,
                characteristic,
                request,
                result,
            } => {
                let Some(address) =
                    self.resolve_pending(&handle, characteristic, OperationKind::Read, request)
                else {
                    return;
                };
                match result {
                    Ok(value) => {
                        let device = self.snapshot(&address);
                        self.dispatcher.emit(BleEvent::CharacteristicRead {
                            device,
                            service,
                            characteristic,
                            value,
                        });
                    }
                    Err(reason) => self.dispatcher.emit_error(&BleError::NativeFailure(format!(
                        "Failed to read characteristic {}: {}",
                        characteristic, reason
                    ))),
                }
            }
            NativeEvent::WriteResult {
                handle,
                service,
                characteristic,
                request,
                result,
            } => {
                let Some(address) =
                    self.resolve_pending(&handle, characteristic, OperationKind::Write, request)
                else {
                    return;
                };
                match result {
                    Ok(()) => {
                        let device = self.snapshot(&address);
                        self.dispatcher.emit(BleEvent::CharacteristicWrite {
                            device,
                            service,
                            characteristic,
                        });
                    }
                    Err(reason) => self.dispatcher.emit_error(&BleError::NativeFailure(format!(
                        "Failed to write characteristic {}: {}",
                        characteristic, reason
                    ))),
                }
            }
            NativeEvent::NotifyResult {
                handle,
                characteristic,
                enabled,
                request,
                result,
                ..
            } => {
                let Some(address) =
                    self.resolve_pending(&handle, characteristic, OperationKind::Notify, request)
                else {
                    return;
                };
                match result {
                    Ok(()) => info!(
                        "Notifications for {} on {} {}",
                        characteristic,
                        address,
                        if enabled { "enabled" } else { "disabled" }
                    ),
                    Err(reason) => self.dispatcher.emit_error(&BleError::NativeFailure(format!(
                        "Failed to set notification on {}: {}",
                        characteristic, reason
                    ))),
                }
            }
            NativeEvent::ScanFailed { reason } => {
                if self.scanning {
                    self.scanning = false;
                    self.dispatcher
                        .emit_error(&BleError::NativeFailure(format!("Scan failed: {}", reason)));
                }
            }
        }
    }

    async fn handle_expired(&mut self, address: String, generation: u64) {
        match self.tracker.expire(&address, generation) {
            Some(ConnectionState::Connecting) => {
                self.router.clear_device(&address);
                if let Ok(handle) = self.registry.resolve(&address) {
                    self.release(&handle).await;
                }
                self.dispatcher.emit_error(&BleError::Timeout(format!(
                    "connection to {} did not complete within {} ms",
                    address, self.config.connect_timeout_ms
                )));
            }
            Some(ConnectionState::Disconnecting) => {
                warn!("No disconnect ack from {}, forcing disconnected.", address);
                self.router.clear_device(&address);
                let device = self.snapshot(&address);
                self.dispatcher.emit(BleEvent::DeviceDisconnected { device });
            }
            _ => {}
        }
    }

    /// Address of a handle, if it belongs to the current session.
    fn known_address(&self, handle: &T::Handle) -> Option<String> {
        let address = self.transport.address_of(handle);
        if self.registry.contains(&address) {
            Some(address)
        } else {
            debug!("Dropping native event for unknown peripheral {}", address);
            None
        }
    }

    /// Matches a native completion to the request that is still pending.
    fn resolve_pending(
        &mut self,
        handle: &T::Handle,
        characteristic: Uuid,
        kind: OperationKind,
        request: RequestId,
    ) -> Option<String> {
        let address = self.known_address(handle)?;
        if self
            .router
            .complete(&PendingKey::new(&address, characteristic, kind), request)
        {
            Some(address)
        } else {
            debug!(
                "Dropping stale {:?} completion #{} for {} on {}",
                kind, request, characteristic, address
            );
            None
        }
    }

    /// Best-effort native disconnect with no state change of its own. The ack
    /// it produces is absorbed by `absorb_release_ack`.
    async fn release(&mut self, handle: &T::Handle) {
        let Ok(events) = self.events() else {
            return;
        };
        match self.transport.disconnect(handle, events).await {
            Ok(()) => {
                *self
                    .releasing
                    .entry(self.transport.address_of(handle))
                    .or_default() += 1;
            }
            Err(e) => warn!("Failed to release {:?}: {}", handle, e),
        }
    }

    /// True if this disconnect answers an earlier release.
    fn absorb_release_ack(&mut self, handle: &T::Handle) -> bool {
        let address = self.transport.address_of(handle);
        let Some(owed) = self.releasing.get_mut(&address) else {
            return false;
        };
        *owed -= 1;
        if *owed == 0 {
            self.releasing.remove(&address);
        }
        debug!("Absorbed disconnect ack for released {}", address);
        true
    }

    fn snapshot(&self, address: &str) -> Device {
        let info = self.registry.info(address).cloned().unwrap_or_default();
        Device::new(
            info.name.as_deref(),
            address,
            info.rssi,
            self.tracker.is_connected(address),
        )
    }

    fn events(&self) -> Result<NativeEvents<T::Handle>> {
        self.loopback
            .upgrade()
            .map(NativeEvents::new)
            .ok_or(BleError::ManagerStopped)
    }

    fn arm_timer(&self, address: &str, generation: u64, wait: Duration) {
        let Some(loopback) = self.loopback.upgrade() else {
            return;
        };
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = loopback.send(Inbound::Expired {
                address,
                generation,
            });
        });
    }
}
