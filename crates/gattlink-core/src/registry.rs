// ── Connection registry and reconnection scheduler ──
//
// The registry exclusively owns the desired-connection entries. Every
// event it emits carries deep-copied snapshots; consumers never see a
// live reference into the table.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::device::{ConnectionEntry, ConnectionErrorInfo};
use gattlink_ble::{
    AdapterDriver, AdapterState, Address, DriverEvent, SecurityParams, SecurityReplyStatus,
};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 64;

/// Driver events the registry consumes. Registering one of these twice
/// is a fatal configuration error.
const DRIVER_LISTENERS: &[&str] = &[
    "adapterStateChange",
    "deviceDiscovered",
    "connectionUp",
    "connectionDown",
    "connectTimedOut",
    "connectCanceled",
    "connectionError",
    "connectionSecurityRequest",
    "connectionSecurityParametersRequest",
    "connectionAuthenticationStatus",
];

/// Change notifications emitted by the registry. All payloads are
/// snapshots.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// The full entry set after a mutation. Exactly one per
    /// `reconcile` call.
    DatabaseChange(Vec<ConnectionEntry>),
    ConnectionUp(ConnectionEntry),
    ConnectionDown(ConnectionEntry),
    ConnectionRemoved(ConnectionEntry),
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Arc<dyn AdapterDriver>,
    entries: Mutex<Vec<ConnectionEntry>>,
    events_tx: broadcast::Sender<RegistryEvent>,
    /// Device id currently receiving firmware; the scheduler skips it.
    fota_gate: watch::Receiver<Option<String>>,
    tick: Duration,
    next_index: AtomicUsize,
    listeners: Mutex<HashSet<&'static str>>,
    started: AtomicBool,
    ble_enabled: AtomicBool,
    cancel: CancellationToken,
    scheduler: Mutex<Option<CancellationToken>>,
}

impl ConnectionRegistry {
    pub fn new(driver: Arc<dyn AdapterDriver>, fota_gate: watch::Receiver<Option<String>>) -> Self {
        Self::with_tick_interval(driver, fota_gate, DEFAULT_TICK_INTERVAL)
    }

    pub fn with_tick_interval(
        driver: Arc<dyn AdapterDriver>,
        fota_gate: watch::Receiver<Option<String>>,
        tick: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                driver,
                entries: Mutex::new(Vec::new()),
                events_tx,
                fota_gate,
                tick,
                next_index: AtomicUsize::new(0),
                listeners: Mutex::new(HashSet::new()),
                started: AtomicBool::new(false),
                ble_enabled: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to registry change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Register driver listeners and validate preconditions. The
    /// scheduler itself starts when the adapter reports BLE enabled.
    ///
    /// Fails fast when BLE is already enabled: the scheduler must race
    /// the adapter from a known-disabled state.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyStarted);
        }
        let state = self.inner.driver.get_state().await;
        if state.ble_enabled {
            return Err(CoreError::BleAlreadyEnabled);
        }

        {
            let mut listeners = self.inner.listeners.lock().await;
            for &event in DRIVER_LISTENERS {
                if !listeners.insert(event) {
                    return Err(CoreError::ListenerAlreadyRegistered { event });
                }
            }
        }

        let mut events = self.inner.driver.events();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => inner.handle_driver_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "driver event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("registry event task stopped");
        });

        info!("connection registry started");
        Ok(())
    }

    /// Mark everything disconnected and halt the scheduler. Terminal.
    pub async fn stop(&self) {
        self.inner.stop_scheduler().await;
        self.inner.cancel.cancel();
        self.inner.mark_all_disconnected().await;
        info!("connection registry stopped");
    }

    /// Apply a new desired set. Additions start disconnected with
    /// default status; for ids already present only the raw cloud
    /// payload is overwritten, never a live connection's address or
    /// options. Emits exactly one `DatabaseChange` per call.
    pub async fn reconcile(&self, desired: Vec<ConnectionEntry>) {
        let mut removed = Vec::new();
        {
            let mut entries = self.inner.entries.lock().await;
            let desired_ids: HashSet<&str> = desired.iter().map(|e| e.id.as_str()).collect();

            let mut keep = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if desired_ids.contains(entry.id.as_str()) {
                    keep.push(entry);
                } else {
                    removed.push(entry);
                }
            }
            *entries = keep;

            for want in desired {
                if let Some(existing) = entries.iter_mut().find(|e| e.id == want.id) {
                    existing.raw = want.raw;
                } else {
                    info!(device = %want.id, "adding desired connection");
                    entries.push(want);
                }
            }
        }

        for entry in removed {
            info!(device = %entry.id, "removing desired connection");
            if let Err(e) = self.inner.driver.disconnect(&entry.address).await {
                warn!(device = %entry.address, error = %e, "disconnect during removal failed");
            }
            self.inner.emit(RegistryEvent::ConnectionRemoved(entry));
        }

        let snapshot = self.inner.entries.lock().await.clone();
        self.inner.emit(RegistryEvent::DatabaseChange(snapshot));
    }

    pub async fn get_connection(&self, id: &str) -> Option<ConnectionEntry> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn get_all_connections(&self) -> Vec<ConnectionEntry> {
        self.inner.entries.lock().await.clone()
    }

    /// Address lookup; the match ignores address type when the query's
    /// type is unset.
    pub async fn find_by_address(&self, address: &Address) -> Option<ConnectionEntry> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.address.matches(address))
            .cloned()
    }
}

impl Inner {
    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }

    async fn start_scheduler(self: &Arc<Self>) {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *guard = Some(token.clone());
        drop(guard);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => inner.tick_once().await,
                }
            }
            debug!("reconnection scheduler stopped");
        });
        info!("reconnection scheduler started");
    }

    async fn stop_scheduler(&self) {
        if let Some(token) = self.scheduler.lock().await.take() {
            token.cancel();
        }
    }

    /// One scheduler pass: pick the next disconnected candidate
    /// round-robin and attempt it. The attempt is awaited in the tick
    /// loop, so at most one is in flight across the registry.
    async fn tick_once(&self) {
        let state = self.driver.get_state().await;
        if !state.available || !state.ble_enabled || state.connecting {
            return;
        }
        let mid_update = self.fota_gate.borrow().clone();

        let attempt = {
            let mut entries = self.entries.lock().await;
            let candidates: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    !e.status.connected
                        && !e.status.connecting
                        && mid_update.as_deref() != Some(e.id.as_str())
                })
                .map(|(i, _)| i)
                .collect();
            if candidates.is_empty() {
                None
            } else {
                // Index modulo the current candidate count keeps the
                // rotation stable when the set resizes between ticks.
                let slot = self.next_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
                let entry = &mut entries[candidates[slot]];
                entry.status.connecting = true;
                Some((
                    entry.id.clone(),
                    entry.address.clone(),
                    entry.connect_options.clone(),
                ))
            }
        };
        let Some((id, address, options)) = attempt else {
            return;
        };

        debug!(device = %address, "attempting connection");
        let result = self.driver.connect(&address, &options).await;
        if let Err(e) = &result {
            debug!(device = %address, error = %e, "connect attempt failed");
        }
        // Clear the transient lock regardless of outcome; connected
        // state is driven by the ConnectionUp event.
        if let Some(entry) = self
            .entries
            .lock()
            .await
            .iter_mut()
            .find(|e| e.id == id)
        {
            entry.status.connecting = false;
        }
    }

    async fn mark_all_disconnected(&self) {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            for entry in &mut *entries {
                entry.status.connected = false;
                entry.status.connecting = false;
            }
            entries.clone()
        };
        self.emit(RegistryEvent::DatabaseChange(snapshot));
    }

    async fn handle_driver_event(self: &Arc<Self>, event: DriverEvent) {
        match event {
            DriverEvent::AdapterStateChange(state) => self.on_adapter_state(state).await,
            DriverEvent::ConnectionUp(address) => self.on_connection_up(&address).await,
            DriverEvent::ConnectionDown(address) => self.on_connection_down(&address).await,
            DriverEvent::ConnectTimedOut(address) => {
                self.update_entry(&address, |e| {
                    e.status.connected = false;
                    e.status.connect_timed_out = true;
                })
                .await;
            }
            DriverEvent::ConnectCanceled(address) => {
                self.update_entry(&address, |e| e.status.connected = false)
                    .await;
            }
            DriverEvent::ConnectionError {
                address,
                description,
                code,
            } => {
                self.update_entry(&address, |e| {
                    e.status.error = Some(ConnectionErrorInfo { code, description });
                })
                .await;
            }
            DriverEvent::ConnectionSecurityRequest { address, .. } => {
                self.on_security_request(&address).await;
            }
            DriverEvent::ConnectionSecurityParametersRequest { address, .. } => {
                // Accept with our defaults.
                if let Err(e) = self
                    .driver
                    .security_parameters_reply(&address, SecurityReplyStatus::Success, None)
                    .await
                {
                    warn!(device = %address, error = %e, "security parameters reply failed");
                }
            }
            DriverEvent::ConnectionAuthenticationStatus { address, status } => {
                // Idempotent: the first recorded status wins.
                let changed = self
                    .update_entry(&address, |e| {
                        if e.status.auth.is_none() {
                            e.status.auth = Some(status.clone());
                        }
                    })
                    .await;
                if changed {
                    let snapshot = self.entries.lock().await.clone();
                    self.emit(RegistryEvent::DatabaseChange(snapshot));
                }
            }
            DriverEvent::DeviceDiscovered(discovered) => {
                self.update_entry(&discovered.address, |e| {
                    if discovered.name.is_some() {
                        e.device_name.clone_from(&discovered.name);
                    }
                    if discovered.rssi.is_some() {
                        e.statistics.rssi = discovered.rssi;
                    }
                })
                .await;
            }
            // Scanning and attribute events belong to the engine.
            _ => {}
        }
    }

    async fn on_adapter_state(self: &Arc<Self>, state: AdapterState) {
        let was_enabled = self.ble_enabled.swap(state.ble_enabled, Ordering::SeqCst);
        if !state.available {
            warn!("adapter unavailable; marking all connections down");
            self.mark_all_disconnected().await;
        }
        if state.ble_enabled && !was_enabled {
            self.start_scheduler().await;
        } else if !state.ble_enabled && was_enabled {
            self.stop_scheduler().await;
        }
    }

    async fn on_connection_up(&self, address: &Address) {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entry_for(&mut entries, address) else {
                debug!(device = %address, "connection up for unknown device");
                return;
            };
            entry.status.connected = true;
            entry.status.connect_timed_out = false;
            entry.status.error = None;
            entry.statistics.last_connect = Some(Utc::now());
            entry.statistics.connect_count += 1;
            entry.clone()
        };
        info!(device = %snapshot.id, "connection up");

        if snapshot.connect_options.security.initiate {
            let driver = Arc::clone(&self.driver);
            let peer = snapshot.address.clone();
            tokio::spawn(async move {
                if let Err(e) = driver
                    .authenticate(&peer, &SecurityParams::low_capability())
                    .await
                {
                    warn!(device = %peer, error = %e, "authenticate after connect failed");
                }
            });
        }
        self.emit(RegistryEvent::ConnectionUp(snapshot));
    }

    async fn on_connection_down(&self, address: &Address) {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entry_for(&mut entries, address) else {
                return;
            };
            entry.status.connected = false;
            entry.status.connecting = false;
            entry.statistics.last_disconnect = Some(Utc::now());
            entry.statistics.disconnect_count += 1;
            entry.clone()
        };
        info!(device = %snapshot.id, "connection down");
        self.emit(RegistryEvent::ConnectionDown(snapshot));
    }

    async fn on_security_request(&self, address: &Address) {
        let auto_accept = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .find(|e| e.address.address == address.address)
                .is_none_or(|e| e.connect_options.security.auto_accept)
        };
        if !auto_accept {
            debug!(device = %address, "ignoring security request (autoAccept off)");
            return;
        }
        if let Err(e) = self
            .driver
            .authenticate(address, &SecurityParams::low_capability())
            .await
        {
            warn!(device = %address, error = %e, "security request reply failed");
        }
    }

    /// Apply `f` to the entry for `address`. Returns whether an entry
    /// was found.
    async fn update_entry<F: FnOnce(&mut ConnectionEntry)>(
        &self,
        address: &Address,
        f: F,
    ) -> bool {
        let mut entries = self.entries.lock().await;
        match entry_for(&mut entries, address) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}

/// Lifecycle events are matched on the bare address string; entry ids
/// are the address, and the adapter may resolve a different address
/// type than the assumed one.
fn entry_for<'a>(
    entries: &'a mut [ConnectionEntry],
    address: &Address,
) -> Option<&'a mut ConnectionEntry> {
    entries
        .iter_mut()
        .find(|e| e.address.address == address.address)
}
