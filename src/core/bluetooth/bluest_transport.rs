//! Native binding over bluest
//! Issues every request on a background task and reports the outcome through
//! the manager's native event queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use log::{debug, info, warn};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::config::manager_config::ManagerConfig;
use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::manager::BleManager;
use crate::core::bluetooth::native::{NativeEvents, NativeTransport};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{RequestId, ServiceMap};

/// Process-wide adapter, initialised on first use and kept until exit.
/// A failed initialisation leaves the cell empty so the next call retries.
static ADAPTER: OnceCell<Adapter> = OnceCell::const_new();

/// How often a live link is checked for a spontaneous disconnect
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Longest wait for the system adapter to become available
const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(5);

type CharacteristicCache = HashMap<(Uuid, Uuid), Characteristic>;

/// Per-peripheral connection bookkeeping.
struct Link {
    /// Cancels the connect attempt and the link watcher
    cancel: CancellationToken,
    characteristics: CharacteristicCache,
}

type Links = Arc<Mutex<HashMap<String, Link>>>;

pub struct BluestTransport {
    reconcile_interval: Option<Duration>,
    scanner: AsyncMutex<BluetoothScanner>,
    links: Links,
    notification_handler: NotificationHandler,
}

impl BluestTransport {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            scanner: AsyncMutex::new(BluetoothScanner::new()),
            links: Arc::new(Mutex::new(HashMap::new())),
            notification_handler: NotificationHandler::new(),
        }
    }

    /// Builds a manager over the system's default adapter.
    pub fn manager(config: ManagerConfig) -> BleManager<Self> {
        BleManager::new(Self::new(&config), config)
    }

    async fn adapter() -> Result<Adapter> {
        ADAPTER
            .get_or_try_init(|| {
                within(ADAPTER_READY_TIMEOUT, "Bluetooth adapter", async {
                    let adapter = Adapter::default().await.ok_or_else(|| {
                        BleError::TransportUnavailable("No Bluetooth adapter found".to_string())
                    })?;
                    adapter
                        .wait_available()
                        .await
                        .map_err(|e| BleError::TransportUnavailable(e.to_string()))?;
                    info!("Bluetooth adapter is available.");
                    Ok(adapter)
                })
            })
            .await
            .cloned()
    }

    /// Drops the link state and every notification subscription of `address`.
    fn forget_link(links: &Links, notifications: &NotificationHandler, address: &str) {
        if let Some(link) = Self::lock_links(links).remove(address) {
            link.cancel.cancel();
        }
        notifications.stop_device(address);
    }

    fn lock_links(links: &Links) -> std::sync::MutexGuard<'_, HashMap<String, Link>> {
        links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn characteristic(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        Self::lock_links(&self.links)
            .get(address)
            .and_then(|link| link.characteristics.get(&(service, characteristic)))
            .cloned()
            .ok_or_else(|| {
                BleError::NativeFailure(format!(
                    "characteristic {} not resolved on {}",
                    characteristic, address
                ))
            })
    }

    /// Connects if needed and walks the full service/characteristic tree.
    async fn establish(adapter: &Adapter, device: &Device) -> Result<(ServiceMap, CharacteristicCache)> {
        if !device.is_connected().await {
            adapter.connect_device(device).await?;
        }

        info!("Connection successful, discovering services...");
        let mut layout = ServiceMap::new();
        let mut cache = CharacteristicCache::new();
        for service in device.discover_services().await? {
            let service_uuid = service.uuid();
            let characteristics = layout.entry(service_uuid).or_default();
            for characteristic in service.discover_characteristics().await? {
                let characteristic_uuid = characteristic.uuid();
                debug!("Found characteristic {} in service {}", characteristic_uuid, service_uuid);
                characteristics.insert(characteristic_uuid);
                cache.insert((service_uuid, characteristic_uuid), characteristic);
            }
        }
        Ok((layout, cache))
    }

    /// Reports a spontaneous disconnect once the link drops.
    async fn watch_link(
        device: Device,
        address: String,
        links: Links,
        notifications: NotificationHandler,
        events: NativeEvents<Device>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(LINK_CHECK_INTERVAL) => {
                    if !device.is_connected().await {
                        info!("Device {} lost connection.", address);
                        Self::forget_link(&links, &notifications, &address);
                        events.on_disconnected(device);
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl NativeTransport for BluestTransport {
    type Handle = Device;

    fn address_of(&self, handle: &Device) -> String {
        handle.id().to_string()
    }

    async fn start_scan(&self, events: NativeEvents<Device>) -> Result<()> {
        let adapter = Self::adapter().await?;
        self.scanner
            .lock()
            .await
            .start_scan(adapter, events, self.reconcile_interval)
            .await
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanner.lock().await.stop_scan().await;
        Ok(())
    }

    async fn connect(&self, handle: &Device, events: NativeEvents<Device>) -> Result<()> {
        let adapter = Self::adapter().await?;
        let device = handle.clone();
        let address = self.address_of(handle);
        let cancel = CancellationToken::new();

        if let Some(previous) = Self::lock_links(&self.links).insert(
            address.clone(),
            Link {
                cancel: cancel.clone(),
                characteristics: CharacteristicCache::new(),
            },
        ) {
            previous.cancel.cancel();
        }

        let links = self.links.clone();
        let notifications = self.notification_handler.clone();
        tokio::spawn(async move {
            info!("Initiating connection to {}...", address);
            let established = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connection attempt to {} aborted.", address);
                    return;
                }
                result = Self::establish(&adapter, &device) => result,
            };

            match established {
                Ok((layout, cache)) => {
                    if let Some(link) = Self::lock_links(&links).get_mut(&address) {
                        link.characteristics = cache;
                    }
                    events.on_connected(device.clone());
                    events.on_services_discovered(device.clone(), layout);
                    Self::watch_link(device, address, links, notifications, events, cancel)
                        .await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    Self::lock_links(&links).remove(&address);
                    events.on_connect_failed(device, e.to_string());
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, handle: &Device, events: NativeEvents<Device>) -> Result<()> {
        let adapter = Self::adapter().await?;
        let device = handle.clone();
        let address = self.address_of(handle);

        Self::forget_link(&self.links, &self.notification_handler, &address);

        tokio::spawn(async move {
            info!("Disconnecting from device {}", address);
            match adapter.disconnect_device(&device).await {
                Ok(()) => {
                    info!("Successfully disconnected");
                    events.on_disconnected(device);
                }
                Err(e) => {
                    if device.is_connected().await {
                        warn!("Failed to disconnect {}: {}", address, e);
                    } else {
                        debug!("Disconnect of {} reported {}, link is down anyway", address, e);
                        events.on_disconnected(device);
                    }
                }
            }
        });
        Ok(())
    }

    async fn read(
        &self,
        handle: &Device,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        events: NativeEvents<Device>,
    ) -> Result<()> {
        let target = self.characteristic(&self.address_of(handle), service, characteristic)?;
        let device = handle.clone();
        tokio::spawn(async move {
            let result = target.read().await.map_err(|e| e.to_string());
            events.on_read_result(device, service, characteristic, request, result);
        });
        Ok(())
    }

    async fn write(
        &self,
        handle: &Device,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        request: RequestId,
        events: NativeEvents<Device>,
    ) -> Result<()> {
        let target = self.characteristic(&self.address_of(handle), service, characteristic)?;
        let device = handle.clone();
        tokio::spawn(async move {
            let result = target.write(&value).await.map_err(|e| e.to_string());
            events.on_write_result(device, service, characteristic, request, result);
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        handle: &Device,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
        request: RequestId,
        events: NativeEvents<Device>,
    ) -> Result<()> {
        let address = self.address_of(handle);
        if enable {
            let target = self.characteristic(&address, service, characteristic)?;
            self.notification_handler
                .enable(address, handle.clone(), service, target, request, events);
        } else {
            self.notification_handler.disable(
                &address,
                handle.clone(),
                service,
                characteristic,
                request,
                events,
            );
        }
        Ok(())
    }
}

/// Bounds a wait on the native stack; expiry means the transport is unavailable.
async fn within<T>(
    wait: Duration,
    what: &str,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(wait, operation).await.map_err(|_| {
        BleError::TransportUnavailable(format!(
            "{} did not respond within {} ms",
            what,
            wait.as_millis()
        ))
    })?
}
