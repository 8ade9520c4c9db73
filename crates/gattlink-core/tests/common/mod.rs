//! Test doubles shared by the integration suites.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use gattlink_ble::{
    AdapterDriver, AdapterState, Address, ConnectOptions, DfuDriver, DfuUpdate, DriverError,
    DriverEvent, ScanRequest, SecurityParams, SecurityReplyStatus, Service, UpdateArtifact,
    UpdateStatus,
};
use gattlink_core::transport::{CloudTransport, TransportError, TransportMessage};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test mutex poisoned")
}

// ── Adapter driver ───────────────────────────────────────────────────

pub struct MockDriver {
    events: broadcast::Sender<DriverEvent>,
    state: Mutex<AdapterState>,
    pub connect_succeeds: AtomicBool,
    pub connects: Mutex<Vec<Address>>,
    pub disconnects: Mutex<Vec<Address>>,
    pub authenticates: Mutex<Vec<Address>>,
    pub param_replies: Mutex<Vec<Address>>,
    pub scans: Mutex<Vec<ScanRequest>>,
    pub watched: Mutex<Vec<String>>,
    pub writes: Mutex<Vec<(String, Vec<u8>)>>,
    pub attributes: Mutex<Vec<Service>>,
    pub read_value: Mutex<Vec<u8>>,
    pub get_attributes_calls: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            state: Mutex::new(AdapterState {
                available: true,
                ..AdapterState::default()
            }),
            connect_succeeds: AtomicBool::new(true),
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            authenticates: Mutex::new(Vec::new()),
            param_replies: Mutex::new(Vec::new()),
            scans: Mutex::new(Vec::new()),
            watched: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            attributes: Mutex::new(Vec::new()),
            read_value: Mutex::new(Vec::new()),
            get_attributes_calls: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_ble_enabled(&self, enabled: bool) {
        locked(&self.state).ble_enabled = enabled;
    }

    /// Flip the adapter to enabled and announce it, as a powered-on
    /// dongle would.
    pub fn enable_ble(&self) {
        let state = {
            let mut state = locked(&self.state);
            state.ble_enabled = true;
            *state
        };
        self.emit(DriverEvent::AdapterStateChange(state));
    }

    pub fn connect_count(&self) -> usize {
        locked(&self.connects).len()
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        locked(&self.connects)
            .iter()
            .map(|a| a.address.clone())
            .collect()
    }
}

#[async_trait]
impl AdapterDriver for MockDriver {
    async fn open(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn reset(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn connect(
        &self,
        address: &Address,
        _options: &ConnectOptions,
    ) -> Result<Address, DriverError> {
        locked(&self.connects).push(address.clone());
        if self.connect_succeeds.load(Ordering::SeqCst) {
            self.emit(DriverEvent::ConnectionUp(address.clone()));
            Ok(address.clone())
        } else {
            Err(DriverError::ConnectFailed {
                address: address.clone(),
                reason: "peer unreachable".into(),
            })
        }
    }

    async fn disconnect(&self, address: &Address) -> Result<(), DriverError> {
        locked(&self.disconnects).push(address.clone());
        Ok(())
    }

    async fn authenticate(
        &self,
        address: &Address,
        _params: &SecurityParams,
    ) -> Result<(), DriverError> {
        locked(&self.authenticates).push(address.clone());
        Ok(())
    }

    async fn security_parameters_reply(
        &self,
        address: &Address,
        _status: SecurityReplyStatus,
        _params: Option<&SecurityParams>,
    ) -> Result<(), DriverError> {
        locked(&self.param_replies).push(address.clone());
        Ok(())
    }

    async fn set_default_security_parameters(
        &self,
        _params: &SecurityParams,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), DriverError> {
        locked(&self.scans).push(request.clone());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn get_attributes(&self, _address: &Address) -> Result<Vec<Service>, DriverError> {
        self.get_attributes_calls.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.attributes).clone())
    }

    async fn read_characteristic_value(
        &self,
        _address: &Address,
        _path: &str,
    ) -> Result<Vec<u8>, DriverError> {
        Ok(locked(&self.read_value).clone())
    }

    async fn write_characteristic_value(
        &self,
        _address: &Address,
        path: &str,
        value: &[u8],
        _ack: bool,
    ) -> Result<(), DriverError> {
        locked(&self.writes).push((path.to_owned(), value.to_vec()));
        Ok(())
    }

    async fn read_descriptor_value(
        &self,
        _address: &Address,
        _path: &str,
    ) -> Result<Vec<u8>, DriverError> {
        Ok(locked(&self.read_value).clone())
    }

    async fn write_descriptor_value(
        &self,
        _address: &Address,
        path: &str,
        value: &[u8],
        _ack: bool,
    ) -> Result<(), DriverError> {
        locked(&self.writes).push((path.to_owned(), value.to_vec()));
        Ok(())
    }

    async fn watch_devices(&self, addresses: Vec<String>) -> Result<(), DriverError> {
        locked(&self.watched).extend(addresses);
        Ok(())
    }

    async fn unwatch_devices(&self, addresses: Vec<String>) -> Result<(), DriverError> {
        locked(&self.watched).retain(|a| !addresses.contains(a));
        Ok(())
    }

    async fn get_state(&self) -> AdapterState {
        *locked(&self.state)
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

// ── Cloud transport ──────────────────────────────────────────────────

pub struct CapturingTransport {
    inbound: broadcast::Sender<TransportMessage>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub subscriptions: Mutex<Vec<String>>,
}

impl CapturingTransport {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            inbound,
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a message as if the broker pushed it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(TransportMessage {
            topic: topic.to_owned(),
            payload: Bytes::from(payload.into()),
        });
    }

    pub fn inject_json(&self, topic: &str, payload: serde_json::Value) {
        self.inject(topic, payload.to_string().into_bytes());
    }

    /// Parsed payloads published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        locked(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }
}

#[async_trait]
impl CloudTransport for CapturingTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        locked(&self.published).push((topic.to_owned(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        locked(&self.subscriptions).push(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        locked(&self.subscriptions).retain(|t| t != topic);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.inbound.subscribe()
    }
}

// ── Update driver ────────────────────────────────────────────────────

pub struct MockDfu {
    pub artifacts: Mutex<Vec<(String, UpdateArtifact)>>,
    scripts: Mutex<VecDeque<Vec<DfuUpdate>>>,
    hold: AtomicBool,
    held: Mutex<Vec<mpsc::Sender<DfuUpdate>>>,
}

impl MockDfu {
    pub fn new() -> Self {
        Self {
            artifacts: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            hold: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Keep update streams open so jobs stay in flight.
    pub fn hold_updates(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Queue the status updates the next job receives.
    pub fn push_script(&self, updates: Vec<DfuUpdate>) {
        locked(&self.scripts).push_back(updates);
    }

    pub fn terminal(status: UpdateStatus) -> DfuUpdate {
        DfuUpdate {
            id: "update".into(),
            status: Some(status),
            ..DfuUpdate::default()
        }
    }
}

#[async_trait]
impl DfuDriver for MockDfu {
    async fn start_update(
        &self,
        artifact: UpdateArtifact,
        device_id: &str,
    ) -> Result<mpsc::Receiver<DfuUpdate>, DriverError> {
        locked(&self.artifacts).push((device_id.to_owned(), artifact));
        let (tx, rx) = mpsc::channel(16);
        if self.hold.load(Ordering::SeqCst) {
            locked(&self.held).push(tx);
            return Ok(rx);
        }
        let script = locked(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| vec![Self::terminal(UpdateStatus::DfuCompleted)]);
        tokio::spawn(async move {
            for update in script {
                let _ = tx.send(update).await;
            }
        });
        Ok(rx)
    }
}

/// Let spawned tasks and channels settle on the current-thread runtime.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
