#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ble_center_lib::config::manager_config::ManagerConfig;
use ble_center_lib::core::bluetooth::{
    BleError, BleEvent, BleManager, NativeEvents, NativeTransport, RequestId, Result, ServiceMap,
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ADDRESS: &str = "AA:BB";
pub const HEART_RATE: &str = "180D";
pub const HEART_RATE_MEASUREMENT: &str = "2A37";
pub const BODY_SENSOR_LOCATION: &str = "2A38";

pub fn uuid(short: &str) -> Uuid {
    ble_center_lib::utils::parse_uuid(short).unwrap()
}

/// Native request recorded by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect(String),
    Read(String, Uuid),
    Write(String, Uuid, Vec<u8>),
    Notify(String, Uuid, bool),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    events: Option<NativeEvents<String>>,
    requests: Vec<RequestId>,
    refuse: bool,
}

/// Transport double: records requests and lets the test play the native
/// stack. The handle is the address itself.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    fn record(&self, call: Call, events: Option<NativeEvents<String>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(events) = events {
            state.events = Some(events);
        }
        state.calls.push(call);
        if state.refuse {
            return Err(BleError::NativeFailure("refused".to_string()));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Id of the most recent GATT request.
    pub fn last_request(&self) -> RequestId {
        *self
            .state
            .lock()
            .unwrap()
            .requests
            .last()
            .expect("no GATT request issued yet")
    }

    fn track_request(&self, request: RequestId) {
        self.state.lock().unwrap().requests.push(request);
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Makes every following request fail to issue.
    pub fn refuse_requests(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    /// Event source handed to the most recent request.
    pub fn events(&self) -> NativeEvents<String> {
        self.state
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("no native request issued yet")
    }
}

#[async_trait]
impl NativeTransport for FakeTransport {
    type Handle = String;

    fn address_of(&self, handle: &String) -> String {
        handle.clone()
    }

    async fn start_scan(&self, events: NativeEvents<String>) -> Result<()> {
        self.record(Call::StartScan, Some(events))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan, None)
    }

    async fn connect(&self, handle: &String, events: NativeEvents<String>) -> Result<()> {
        self.record(Call::Connect(handle.clone()), Some(events))
    }

    async fn disconnect(&self, handle: &String, events: NativeEvents<String>) -> Result<()> {
        self.record(Call::Disconnect(handle.clone()), Some(events))
    }

    async fn read(
        &self,
        handle: &String,
        _service: Uuid,
        characteristic: Uuid,
        request: RequestId,
        events: NativeEvents<String>,
    ) -> Result<()> {
        self.track_request(request);
        self.record(Call::Read(handle.clone(), characteristic), Some(events))
    }

    async fn write(
        &self,
        handle: &String,
        _service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        request: RequestId,
        events: NativeEvents<String>,
    ) -> Result<()> {
        self.track_request(request);
        self.record(Call::Write(handle.clone(), characteristic, value), Some(events))
    }

    async fn set_notify(
        &self,
        handle: &String,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
        request: RequestId,
        events: NativeEvents<String>,
    ) -> Result<()> {
        self.track_request(request);
        self.record(
            Call::Notify(handle.clone(), characteristic, enable),
            Some(events),
        )
    }
}

pub struct Harness {
    pub manager: BleManager<FakeTransport>,
    pub fake: FakeTransport,
    pub events: mpsc::UnboundedReceiver<BleEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(ManagerConfig {
            connect_timeout_ms: 1_000,
            disconnect_timeout_ms: 1_000,
            reconcile_interval_ms: 0,
        })
        .await
    }

    pub async fn with_config(config: ManagerConfig) -> Self {
        let fake = FakeTransport::default();
        let manager = BleManager::new(fake.clone(), config);
        let events = manager.subscribe().await.unwrap();
        Self {
            manager,
            fake,
            events,
        }
    }

    /// Waits until everything queued so far has been processed.
    pub async fn settle(&self) {
        self.manager.devices().await.unwrap();
    }

    /// Events delivered so far, in order.
    pub async fn drain(&mut self) -> Vec<BleEvent> {
        self.settle().await;
        let mut delivered = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            delivered.push(event);
        }
        delivered
    }

    /// Starts a scan and reports `address` as discovered.
    pub async fn discover(&mut self, address: &str, name: Option<&str>, rssi: Option<i16>) {
        self.manager.start_scan().await.unwrap();
        self.fake
            .events()
            .on_discovered(address.to_string(), name.map(str::to_string), rssi);
        self.settle().await;
    }

    /// Discovers and connects `address`, exposing the heart rate service.
    pub async fn connected(&mut self, address: &str) {
        self.discover(address, Some("HR Strap"), Some(-60)).await;
        self.manager.connect(address).await.unwrap();
        let events = self.fake.events();
        events.on_connected(address.to_string());
        events.on_services_discovered(address.to_string(), heart_rate_services());
        self.drain().await;
        self.fake.clear_calls();
    }
}

pub fn heart_rate_services() -> ServiceMap {
    let characteristics: HashSet<Uuid> = [uuid(HEART_RATE_MEASUREMENT), uuid(BODY_SENSOR_LOCATION)]
        .into_iter()
        .collect();
    HashMap::from([(uuid(HEART_RATE), characteristics)])
}

pub fn error_messages(events: &[BleEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            BleEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
