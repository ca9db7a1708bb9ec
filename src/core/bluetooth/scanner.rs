//! Discovery over bluest: a push scan stream plus an optional pull-based
//! reconciliation against the peripherals the OS is already connected to.

use std::time::Duration;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::error::Result;
use crate::core::bluetooth::native::{spawn_polling_discovery, DiscoveredPeripheral, NativeEvents};

pub struct BluetoothScanner {
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    poll_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            poll_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Starts the scan task, stopping a running one first.
    pub async fn start_scan(
        &mut self,
        adapter: Adapter,
        events: NativeEvents<Device>,
        reconcile_interval: Option<Duration>,
    ) -> Result<()> {
        if self.is_scanning() {
            self.stop_scan().await;
        }

        self.cancel_token = CancellationToken::new();

        if let Some(interval) = reconcile_interval {
            let adapter_for_poll = adapter.clone();
            self.poll_task_handle = Some(spawn_polling_discovery(
                interval,
                events.clone(),
                self.cancel_token.child_token(),
                move || Self::connected_snapshot(adapter_for_poll.clone()),
            ));
        }

        let cancel_token_for_task = self.cancel_token.clone();
        self.scan_task_handle = Some(tokio::spawn(async move {
            if let Err(e) =
                Self::internal_scan_task(adapter, events.clone(), cancel_token_for_task).await
            {
                error!("Bluetooth scan failed: {}", e);
                events.on_scan_failed(e.to_string());
            }
        }));

        info!("Device scan task started.");
        Ok(())
    }

    pub async fn stop_scan(&mut self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        for handle in [self.scan_task_handle.take(), self.poll_task_handle.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled successfully.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }

    async fn internal_scan_task(
        adapter: Adapter,
        events: NativeEvents<Device>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        // Peripherals the OS already holds a connection to never advertise.
        info!("Checking for connected devices");
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            snapshot = Self::connected_snapshot(adapter.clone()) => snapshot?,
        };
        for peripheral in connected {
            events.on_discovered(peripheral.handle, peripheral.name, peripheral.rssi);
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            stream = adapter.scan(&[]) => stream?,
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            let device = discovered_device.device;
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered_device.rssi);
                            let name = device.name().ok();
                            events.on_discovered(device, name, discovered_device.rssi);
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn connected_snapshot(adapter: Adapter) -> Result<Vec<DiscoveredPeripheral<Device>>> {
        let mut peripherals = Vec::new();
        for device in adapter.connected_devices().await? {
            let name = device.name().ok();
            let rssi = device.rssi().await.ok();
            peripherals.push(DiscoveredPeripheral {
                handle: device,
                name,
                rssi,
            });
        }
        Ok(peripherals)
    }
}

impl Default for BluetoothScanner {
    fn default() -> Self {
        Self::new()
    }
}
