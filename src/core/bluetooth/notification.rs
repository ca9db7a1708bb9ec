//! Notification handling over bluest
//! Keeps one forwarding task per subscribed characteristic and feeds every
//! value into the native event queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluest::{Characteristic, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::native::NativeEvents;
use crate::core::bluetooth::types::RequestId;

type SubscriptionKey = (String, Uuid);

/// Notification handler for subscribed characteristics
#[derive(Clone, Default)]
pub struct NotificationHandler {
    subscriptions: Arc<Mutex<HashMap<SubscriptionKey, CancellationToken>>>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `characteristic`; a second enable is acknowledged as-is.
    pub fn enable(
        &self,
        address: String,
        device: Device,
        service: Uuid,
        characteristic: Characteristic,
        request: RequestId,
        events: NativeEvents<Device>,
    ) {
        let characteristic_uuid = characteristic.uuid();
        let cancel = CancellationToken::new();
        {
            let mut subscriptions = self.lock();
            let key = (address.clone(), characteristic_uuid);
            if subscriptions.contains_key(&key) {
                events.on_notify_result(device, service, characteristic_uuid, true, request, Ok(()));
                return;
            }
            subscriptions.insert(key, cancel.clone());
        }

        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            info!("Subscribing to notifications on {}...", characteristic_uuid);
            Self::process_notifications(
                device,
                service,
                characteristic,
                request,
                events,
                cancel.clone(),
            )
            .await;
            // A cancelled entry was already removed by disable/stop_device and
            // the key may belong to a newer subscription by now.
            if !cancel.is_cancelled() {
                if let Ok(mut subscriptions) = subscriptions.lock() {
                    subscriptions.remove(&(address, characteristic_uuid));
                }
            }
        });
    }

    pub fn disable(
        &self,
        address: &str,
        device: Device,
        service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        events: NativeEvents<Device>,
    ) {
        if let Some(cancel) = self.lock().remove(&(address.to_string(), characteristic)) {
            cancel.cancel();
        }
        events.on_notify_result(device, service, characteristic, false, request, Ok(()));
    }

    /// Stops every subscription of a peripheral.
    pub fn stop_device(&self, address: &str) {
        self.lock().retain(|(subscribed, _), cancel| {
            if subscribed == address {
                cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Registers a bare subscription entry without a stream behind it.
    #[cfg(test)]
    pub(crate) fn track(&self, address: &str, characteristic: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.lock()
            .insert((address.to_string(), characteristic), cancel.clone());
        cancel
    }

    #[cfg(test)]
    pub(crate) fn is_subscribed(&self, address: &str, characteristic: Uuid) -> bool {
        self.lock()
            .contains_key(&(address.to_string(), characteristic))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionKey, CancellationToken>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process_notifications(
        device: Device,
        service: Uuid,
        characteristic: Characteristic,
        request: RequestId,
        events: NativeEvents<Device>,
        cancel: CancellationToken,
    ) {
        let characteristic_uuid = characteristic.uuid();
        match characteristic.notify().await {
            Ok(mut notification_stream) => {
                events.on_notify_result(
                    device.clone(),
                    service,
                    characteristic_uuid,
                    true,
                    request,
                    Ok(()),
                );
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = notification_stream.next() => match item {
                            Some(Ok(value)) => {
                                debug!("Received data on {}: {:?}", characteristic_uuid, value);
                                events.on_characteristic_changed(
                                    device.clone(),
                                    service,
                                    characteristic_uuid,
                                    value,
                                );
                            }
                            Some(Err(e)) => {
                                error!("Error in notification stream: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                events.on_notify_result(
                    device,
                    service,
                    characteristic_uuid,
                    true,
                    request,
                    Err(e.to_string()),
                );
            }
        }

        info!("Notification stream for {} ended", characteristic_uuid);
    }
}
