// ── Protocol engine ──
//
// Routes cloud messages to the registry, the driver, and the firmware
// pipeline, and translates driver and pipeline events into cloud-bound
// documents. Every operation the cloud initiates ends in either a
// result event or an error event; transport failures never propagate
// back into the broker session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::facade::{CloudFacade, FotaStatus};
use crate::fota::{FotaEvent, FotaJob, FotaPipeline};
use crate::model::attributes::{AttributePath, DiscoveredAttributes};
use crate::model::beacon;
use crate::model::c2g::{Operation, OperationRequest, parse_operation};
use crate::model::device::ConnectionEntry;
use crate::model::g2c::{G2cEvent, ScanReporting};
use crate::model::shadow::{DesiredState, StatusProjection, reported_echo_fragment};
use crate::registry::{ConnectionRegistry, DEFAULT_TICK_INTERVAL, RegistryEvent};
use crate::transport::{CloudTransport, TopicSet, TransportMessage};
use gattlink_ble::{
    AdapterDriver, Address, Characteristic, Descriptor, DeviceDiscovered, DfuDriver, DriverEvent,
    ScanRequest, ScanType, SecurityParams,
};
use gattlink_config::ConfigStore;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub tenant_id: String,
    pub stage: String,
    pub tick_interval: Duration,
}

impl GatewayConfig {
    pub fn new(
        gateway_id: impl Into<String>,
        tenant_id: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            tenant_id: tenant_id.into(),
            stage: stage.into(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Notifications for embedders.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    NameChanged(String),
    ConnectionsChanged,
    StatusChanged,
    DeviceRemoved(String),
    Deleted,
}

struct ActiveScan {
    request_id: String,
    request: ScanRequest,
    batched: Vec<DeviceDiscovered>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    driver: Arc<dyn AdapterDriver>,
    transport: Arc<dyn CloudTransport>,
    store: Arc<dyn ConfigStore>,
    facade: CloudFacade,
    registry: ConnectionRegistry,
    pipeline: Option<FotaPipeline>,
    scan: Mutex<Option<ActiveScan>>,
    /// Addresses the cloud asked us to watch; sightings publish as scan
    /// results even outside an active scan.
    watch_list: Mutex<Vec<String>>,
    /// Discovery cache, keyed by device id. Replaced wholesale on
    /// forced re-discovery, dropped on disconnect.
    attributes: Mutex<HashMap<String, DiscoveredAttributes>>,
    last_status: Mutex<Option<StatusProjection>>,
    name: Mutex<Option<String>>,
    events_tx: broadcast::Sender<GatewayEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        driver: Arc<dyn AdapterDriver>,
        transport: Arc<dyn CloudTransport>,
        dfu: Option<Arc<dyn DfuDriver>>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let topics = TopicSet::new(&config.stage, &config.tenant_id, &config.gateway_id);
        let facade = CloudFacade::new(Arc::clone(&transport), config.gateway_id.clone(), topics);
        let pipeline = dfu.map(|d| FotaPipeline::new(d, reqwest::Client::new()));
        let fota_gate = pipeline
            .as_ref()
            .map_or_else(|| watch::channel(None).1, FotaPipeline::current_device);
        let registry = ConnectionRegistry::with_tick_interval(
            Arc::clone(&driver),
            fota_gate,
            config.tick_interval,
        );
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                transport,
                store,
                facade,
                registry,
                pipeline,
                scan: Mutex::new(None),
                watch_list: Mutex::new(Vec::new()),
                attributes: Mutex::new(HashMap::new()),
                last_status: Mutex::new(None),
                name: Mutex::new(None),
                events_tx,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Wire everything up and spawn the run loop.
    pub async fn start(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyStarted);
        }

        // Subscribe streams before anything can emit into them.
        let transport_rx = inner.transport.messages();
        let registry_rx = inner.registry.subscribe();
        let driver_rx = inner.driver.events();

        inner.registry.start().await?;

        let topics = inner.facade.topics().await;
        inner.transport.subscribe(&topics.c2g()).await?;
        inner.transport.subscribe(&topics.shadow_get_accepted()).await?;
        inner.transport.subscribe(&topics.shadow_update_delta()).await?;
        if inner.pipeline.is_some() {
            inner.transport.subscribe(&topics.fota_receive()).await?;
        }

        inner.driver.open().await?;
        inner
            .driver
            .set_default_security_parameters(&SecurityParams::low_capability())
            .await?;

        inner.facade.publish_shadow_get().await;
        if inner.pipeline.is_some() {
            inner.facade.report_fota_support().await;
        }

        let run = Arc::clone(inner);
        tokio::spawn(async move {
            run.run(transport_rx, registry_rx, driver_rx).await;
        });

        info!(gateway = %inner.config.gateway_id, "gateway started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(pipeline) = &self.inner.pipeline {
            pipeline.stop();
        }
        self.inner.registry.stop().await;
        if let Err(e) = self.inner.driver.close().await {
            warn!(error = %e, "adapter close failed");
        }
        info!("gateway stopped");
    }
}

impl Inner {
    fn emit(&self, event: GatewayEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run(
        self: Arc<Self>,
        mut transport_rx: broadcast::Receiver<TransportMessage>,
        mut registry_rx: broadcast::Receiver<RegistryEvent>,
        mut driver_rx: broadcast::Receiver<DriverEvent>,
    ) {
        // The placeholder sender keeps the arm pending when no update
        // driver is attached.
        let (_idle_fota, mut fota_rx) = match &self.pipeline {
            Some(pipeline) => (None, pipeline.subscribe()),
            None => {
                let (tx, rx) = broadcast::channel(1);
                (Some(tx), rx)
            }
        };

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                msg = transport_rx.recv() => match msg {
                    Ok(msg) => self.handle_message(msg).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "transport stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = registry_rx.recv() => match event {
                    Ok(event) => self.handle_registry_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "registry stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = driver_rx.recv() => match event {
                    Ok(event) => self.handle_driver_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "driver stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = fota_rx.recv() => {
                    if let Ok(event) = event {
                        self.handle_fota_event(event).await;
                    }
                },
            }
        }
        debug!("gateway run loop stopped");
    }

    // ── Message routing ──────────────────────────────────────────────

    async fn handle_message(&self, msg: TransportMessage) {
        let topics = self.facade.topics().await;
        if msg.topic == topics.c2g() {
            self.handle_operation(&msg.payload).await;
        } else if msg.topic == topics.shadow_update_delta() {
            match DesiredState::from_delta(&msg.payload) {
                Ok(state) => self.apply_desired(state).await,
                Err(e) => warn!(error = %e, "dropping malformed shadow delta"),
            }
        } else if msg.topic == topics.shadow_get_accepted() {
            match DesiredState::from_get_accepted(&msg.payload) {
                Ok(state) => self.apply_desired(state).await,
                Err(e) => warn!(error = %e, "dropping malformed shadow snapshot"),
            }
        } else if msg.topic == topics.fota_receive() {
            self.handle_fota_receive(&msg.payload).await;
        } else {
            debug!(topic = %msg.topic, "unroutable message");
        }
    }

    async fn handle_operation(&self, payload: &[u8]) {
        match parse_operation(payload) {
            Ok(Some(request)) => self.dispatch(request).await,
            // Field-incomplete operations are dropped without an error
            // event. Compatibility behavior.
            Ok(None) => warn!("dropping operation with missing fields"),
            Err(e) => {
                warn!(error = %e, "malformed cloud message");
                self.facade.publish_error(&e.to_string(), 400, None).await;
            }
        }
    }

    async fn dispatch(&self, request: OperationRequest) {
        let device = operation_device(&request.operation);
        if let Err(e) = self.run_operation(&request.request_id, request.operation).await {
            warn!(error = %e, device = ?device, "operation failed");
            self.facade
                .publish_error(&e.to_string(), 500, device.as_deref())
                .await;
        }
    }

    async fn run_operation(&self, request_id: &str, operation: Operation) -> Result<(), CoreError> {
        match operation {
            Operation::Scan(request) => self.start_scan(request_id, request).await,
            Operation::Discover { address } => {
                let entry = self.entry_for(&address).await?;
                let attrs = self.discover(&entry, false).await?;
                self.facade
                    .publish_event(
                        &G2cEvent::DeviceDiscoverResult {
                            device: entry,
                            services: attrs.to_cloud_json(),
                        },
                        Some(request_id),
                    )
                    .await;
                Ok(())
            }
            Operation::CharacteristicRead { address, path } => {
                let entry = self.entry_for(&address).await?;
                self.ensure_characteristic(&entry.id, &path).await?;
                let value = self
                    .driver
                    .read_characteristic_value(&entry.address, &path.to_string())
                    .await?;
                let characteristic = self
                    .update_characteristic(&entry.id, &path, value)
                    .await?;
                self.facade
                    .publish_event(
                        &G2cEvent::CharacteristicValueReadResult {
                            device: entry,
                            characteristic,
                        },
                        Some(request_id),
                    )
                    .await;
                Ok(())
            }
            Operation::CharacteristicWrite {
                address,
                path,
                value,
                ack,
            } => {
                let entry = self.entry_for(&address).await?;
                self.ensure_characteristic(&entry.id, &path).await?;
                self.driver
                    .write_characteristic_value(&entry.address, &path.to_string(), &value, ack)
                    .await?;
                let characteristic = self
                    .update_characteristic(&entry.id, &path, value)
                    .await?;
                self.facade
                    .publish_event(
                        &G2cEvent::CharacteristicValueWriteResult {
                            device: entry,
                            characteristic,
                        },
                        Some(request_id),
                    )
                    .await;
                Ok(())
            }
            Operation::DescriptorRead { address, path } => {
                let entry = self.entry_for(&address).await?;
                self.ensure_descriptor(&entry.id, &path).await?;
                let value = self
                    .driver
                    .read_descriptor_value(&entry.address, &path.to_string())
                    .await?;
                let descriptor = self.update_descriptor(&entry.id, &path, value).await?;
                self.facade
                    .publish_event(
                        &G2cEvent::DescriptorValueReadResult {
                            device: entry,
                            descriptor,
                        },
                        Some(request_id),
                    )
                    .await;
                Ok(())
            }
            Operation::DescriptorWrite {
                address,
                path,
                value,
                ack,
            } => {
                let entry = self.entry_for(&address).await?;
                self.ensure_descriptor(&entry.id, &path).await?;
                self.driver
                    .write_descriptor_value(&entry.address, &path.to_string(), &value, ack)
                    .await?;
                let descriptor = self.update_descriptor(&entry.id, &path, value).await?;
                self.facade
                    .publish_event(
                        &G2cEvent::DescriptorValueWriteResult {
                            device: entry,
                            descriptor,
                        },
                        Some(request_id),
                    )
                    .await;
                Ok(())
            }
            Operation::GatewayStatus => {
                debug!("gateway status requested");
                Ok(())
            }
            Operation::DeleteYourself => self.delete_yourself().await,
        }
    }

    async fn start_scan(&self, request_id: &str, request: ScanRequest) -> Result<(), CoreError> {
        let mut active = self.scan.lock().await;
        if active.is_some() {
            debug!("scan already active; ignoring request");
            return Ok(());
        }
        self.driver.start_scan(&request).await?;
        *active = Some(ActiveScan {
            request_id: request_id.to_owned(),
            request,
            batched: Vec::new(),
        });
        Ok(())
    }

    async fn delete_yourself(&self) -> Result<(), CoreError> {
        info!("cloud requested gateway deletion");
        self.registry.reconcile(Vec::new()).await;
        self.registry.stop().await;
        self.store.unlink().await?;
        self.emit(GatewayEvent::Deleted);
        self.cancel.cancel();
        Ok(())
    }

    // ── Shadow reconciliation ────────────────────────────────────────

    async fn apply_desired(&self, state: DesiredState) {
        if let Some(stage) = state.stage {
            self.apply_stage(stage).await;
        }
        if let Some(name) = state.name {
            *self.name.lock().await = Some(name.clone());
            self.emit(GatewayEvent::NameChanged(name));
        }
        if let Some(beacons) = state.beacons {
            *self.watch_list.lock().await = beacons.clone();
            if let Err(e) = self.driver.watch_devices(beacons).await {
                warn!(error = %e, "beacon watch update failed");
            }
        }

        let desired_ids = if let Some(desired) = state.desired_connections {
            let ids = desired.device_ids();
            self.registry.reconcile(desired.to_entries()).await;
            ids
        } else {
            self.registry
                .get_all_connections()
                .await
                .into_iter()
                .map(|e| e.id)
                .collect()
        };

        // Echo the reconciled state so the cloud can confirm
        // convergence.
        let name = self.name.lock().await.clone();
        let stage = self.facade.topics().await.stage().to_owned();
        self.facade
            .publish_shadow_reported(reported_echo_fragment(&desired_ids, name.as_deref(), &stage))
            .await;
    }

    /// Gateway topics move with the stage; shadow topics do not.
    async fn apply_stage(&self, stage: String) {
        let old = self.facade.topics().await;
        if stage == old.stage() {
            return;
        }
        info!(%stage, "environment stage changed; resubscribing");
        if let Err(e) = self.transport.unsubscribe(&old.c2g()).await {
            warn!(error = %e, "unsubscribe failed");
        }
        if self.pipeline.is_some() {
            if let Err(e) = self.transport.unsubscribe(&old.fota_receive()).await {
                warn!(error = %e, "unsubscribe failed");
            }
        }

        let new = TopicSet::new(stage, &self.config.tenant_id, &self.config.gateway_id);
        if let Err(e) = self.transport.subscribe(&new.c2g()).await {
            warn!(error = %e, "subscribe failed");
        }
        if self.pipeline.is_some() {
            if let Err(e) = self.transport.subscribe(&new.fota_receive()).await {
                warn!(error = %e, "subscribe failed");
            }
        }
        self.facade.set_topics(new).await;
    }

    // ── Registry events ──────────────────────────────────────────────

    async fn handle_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::DatabaseChange(entries) => {
                let projection = StatusProjection::from_entries(&entries);
                let mut last = self.last_status.lock().await;
                if last.as_ref() != Some(&projection) {
                    self.facade
                        .publish_shadow_reported(projection.to_reported_fragment())
                        .await;
                    *last = Some(projection);
                    self.emit(GatewayEvent::StatusChanged);
                }
                drop(last);
                self.emit(GatewayEvent::ConnectionsChanged);
            }
            RegistryEvent::ConnectionUp(entry) => {
                self.facade
                    .publish_event(
                        &G2cEvent::DeviceConnectResult {
                            device: entry.clone(),
                        },
                        None,
                    )
                    .await;
                // A fresh session must not serve attributes discovered
                // in a previous one.
                if let Err(e) = self.discover(&entry, true).await {
                    warn!(device = %entry.id, error = %e, "post-connect discovery failed");
                }
                if self.pipeline.is_some() {
                    self.facade.request_jobs(&entry.id).await;
                }
            }
            RegistryEvent::ConnectionDown(entry) => {
                self.attributes.lock().await.remove(&entry.id);
                self.facade
                    .publish_event(&G2cEvent::DeviceDisconnect { device: entry }, None)
                    .await;
            }
            RegistryEvent::ConnectionRemoved(entry) => {
                self.attributes.lock().await.remove(&entry.id);
                self.emit(GatewayEvent::DeviceRemoved(entry.id));
            }
        }
    }

    // ── Driver events ────────────────────────────────────────────────

    async fn handle_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::DeviceDiscovered(discovered) => {
                self.on_scan_results(vec![discovered]).await;
            }
            DriverEvent::DevicesDiscovered(discovered) => {
                self.on_scan_results(discovered).await;
            }
            DriverEvent::ScanTimedOut => {
                let finished = self.scan.lock().await.take();
                if let Some(active) = finished {
                    let sub_type = if active.request.batch {
                        ScanReporting::Batch
                    } else {
                        ScanReporting::Instant
                    };
                    self.facade
                        .publish_event(
                            &G2cEvent::ScanResult {
                                sub_type,
                                devices: active.batched,
                                timeout: true,
                            },
                            Some(&active.request_id),
                        )
                        .await;
                }
            }
            DriverEvent::CharacteristicValueChanged {
                address,
                path,
                characteristic,
            } => {
                self.on_characteristic_changed(&address, &path, characteristic)
                    .await;
            }
            DriverEvent::DescriptorValueChanged {
                address,
                path,
                descriptor,
            } => {
                self.on_descriptor_changed(&address, &path, descriptor).await;
            }
            DriverEvent::AdapterError(description) => {
                warn!(%description, "adapter error");
                self.facade.publish_error(&description, 500, None).await;
            }
            DriverEvent::AdapterWarning(description) => {
                warn!(%description, "adapter warning");
            }
            // Lifecycle events belong to the registry.
            _ => {}
        }
    }

    async fn on_scan_results(&self, discovered: Vec<DeviceDiscovered>) {
        let mut guard = self.scan.lock().await;
        if let Some(active) = guard.as_mut() {
            let passing: Vec<DeviceDiscovered> = discovered
                .into_iter()
                .filter(|d| passes_filter(&active.request, d))
                .collect();
            if passing.is_empty() {
                return;
            }
            if active.request.batch {
                active.batched.extend(passing);
                return;
            }
            let request_id = active.request_id.clone();
            drop(guard);
            self.publish_scan_result(passing, Some(&request_id)).await;
            return;
        }
        drop(guard);

        // No scan is running; sightings of watch-listed devices still
        // go up as scan results.
        let watched: Vec<DeviceDiscovered> = {
            let watch_list = self.watch_list.lock().await;
            discovered
                .into_iter()
                .filter(|d| watch_list.contains(&d.address.address))
                .collect()
        };
        if !watched.is_empty() {
            self.publish_scan_result(watched, None).await;
        }
    }

    async fn publish_scan_result(&self, devices: Vec<DeviceDiscovered>, request_id: Option<&str>) {
        self.facade
            .publish_event(
                &G2cEvent::ScanResult {
                    sub_type: ScanReporting::Instant,
                    devices,
                    timeout: false,
                },
                request_id,
            )
            .await;
    }

    async fn on_characteristic_changed(
        &self,
        address: &Address,
        path: &str,
        characteristic: Characteristic,
    ) {
        let Some(entry) = self.lookup_peer(address).await else {
            return;
        };
        if let Ok(path) = AttributePath::parse(path) {
            let mut cache = self.attributes.lock().await;
            if let Some(cached) = cache
                .get_mut(&entry.id)
                .and_then(|a| a.find_characteristic_mut(&path))
            {
                cached.value.clone_from(&characteristic.value);
            }
        }
        self.facade
            .publish_event(
                &G2cEvent::CharacteristicValueChanged {
                    device: entry,
                    characteristic,
                },
                None,
            )
            .await;
    }

    async fn on_descriptor_changed(&self, address: &Address, path: &str, descriptor: Descriptor) {
        let Some(entry) = self.lookup_peer(address).await else {
            return;
        };
        if let Ok(path) = AttributePath::parse(path) {
            let mut cache = self.attributes.lock().await;
            if let Some(cached) = cache
                .get_mut(&entry.id)
                .and_then(|a| a.find_descriptor_mut(&path))
            {
                cached.value.clone_from(&descriptor.value);
            }
        }
        self.facade
            .publish_event(
                &G2cEvent::DescriptorValueChanged {
                    device: entry,
                    descriptor,
                },
                None,
            )
            .await;
    }

    // ── FOTA ─────────────────────────────────────────────────────────

    async fn handle_fota_receive(&self, payload: &[u8]) {
        let Some(pipeline) = &self.pipeline else {
            debug!("firmware job announced but no update driver attached");
            return;
        };
        let job = match FotaJob::from_tuple(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "dropping malformed firmware announcement");
                return;
            }
        };
        // The device will request outstanding jobs again on its next
        // connect.
        let connected = self
            .registry
            .get_connection(&job.device_id)
            .await
            .is_some_and(|e| e.status.connected);
        if !connected {
            debug!(device = %job.device_id, "ignoring firmware job for disconnected device");
            return;
        }
        pipeline.enqueue(job).await;
    }

    async fn handle_fota_event(&self, event: FotaEvent) {
        match event {
            FotaEvent::DownloadProgress { job, percent } => {
                self.facade
                    .publish_fota_status(
                        &job.device_id,
                        &job.job_id,
                        FotaStatus::Downloading,
                        Some(&percent.to_string()),
                    )
                    .await;
            }
            FotaEvent::DfuStatus { job, update } => {
                let detail = update
                    .status
                    .and_then(|s| serde_json::to_value(s).ok())
                    .and_then(|v| v.as_str().map(str::to_owned));
                self.facade
                    .publish_fota_status(
                        &job.device_id,
                        &job.job_id,
                        FotaStatus::InProgress,
                        detail.as_deref(),
                    )
                    .await;
            }
            FotaEvent::Failed { job, message } => {
                self.facade
                    .publish_fota_status(
                        &job.device_id,
                        &job.job_id,
                        FotaStatus::Failed,
                        Some(&message),
                    )
                    .await;
            }
            FotaEvent::Succeeded { job } => {
                self.facade
                    .publish_fota_status(&job.device_id, &job.job_id, FotaStatus::Succeeded, None)
                    .await;
            }
        }
    }

    // ── Discovery cache ──────────────────────────────────────────────

    /// Serve the cached tree, or run discovery when there is none or
    /// `force_new` is set.
    async fn discover(
        &self,
        entry: &ConnectionEntry,
        force_new: bool,
    ) -> Result<DiscoveredAttributes, CoreError> {
        if !force_new {
            if let Some(cached) = self.attributes.lock().await.get(&entry.id) {
                debug!(device = %entry.id, "serving cached attributes");
                return Ok(cached.clone());
            }
        }
        let services = self.driver.get_attributes(&entry.address).await?;
        let attrs = DiscoveredAttributes::new(services);
        self.attributes
            .lock()
            .await
            .insert(entry.id.clone(), attrs.clone());
        Ok(attrs)
    }

    /// Cache-miss errors are reported, not retried.
    async fn ensure_characteristic(
        &self,
        device_id: &str,
        path: &AttributePath,
    ) -> Result<(), CoreError> {
        let cache = self.attributes.lock().await;
        cache
            .get(device_id)
            .and_then(|a| a.find_characteristic(path))
            .map(|_| ())
            .ok_or_else(|| CoreError::AttributeNotFound {
                path: path.to_string(),
            })
    }

    async fn ensure_descriptor(
        &self,
        device_id: &str,
        path: &AttributePath,
    ) -> Result<(), CoreError> {
        let cache = self.attributes.lock().await;
        cache
            .get(device_id)
            .and_then(|a| a.find_descriptor(path))
            .map(|_| ())
            .ok_or_else(|| CoreError::AttributeNotFound {
                path: path.to_string(),
            })
    }

    async fn update_characteristic(
        &self,
        device_id: &str,
        path: &AttributePath,
        value: Vec<u8>,
    ) -> Result<Characteristic, CoreError> {
        let mut cache = self.attributes.lock().await;
        let characteristic = cache
            .get_mut(device_id)
            .and_then(|a| a.find_characteristic_mut(path))
            .ok_or_else(|| CoreError::AttributeNotFound {
                path: path.to_string(),
            })?;
        characteristic.value = value;
        Ok(characteristic.clone())
    }

    async fn update_descriptor(
        &self,
        device_id: &str,
        path: &AttributePath,
        value: Vec<u8>,
    ) -> Result<Descriptor, CoreError> {
        let mut cache = self.attributes.lock().await;
        let descriptor = cache
            .get_mut(device_id)
            .and_then(|a| a.find_descriptor_mut(path))
            .ok_or_else(|| CoreError::AttributeNotFound {
                path: path.to_string(),
            })?;
        descriptor.value = value;
        Ok(descriptor.clone())
    }

    // ── Lookups ──────────────────────────────────────────────────────

    async fn entry_for(&self, address: &Address) -> Result<ConnectionEntry, CoreError> {
        self.registry
            .find_by_address(address)
            .await
            .ok_or_else(|| CoreError::DeviceNotFound(address.address.clone()))
    }

    /// Driver events may carry a resolved address type differing from
    /// the assumed one, so peers are looked up by bare address.
    async fn lookup_peer(&self, address: &Address) -> Option<ConnectionEntry> {
        self.registry
            .find_by_address(&Address::untyped(address.address.clone()))
            .await
    }
}

fn operation_device(operation: &Operation) -> Option<String> {
    match operation {
        Operation::Discover { address }
        | Operation::CharacteristicRead { address, .. }
        | Operation::CharacteristicWrite { address, .. }
        | Operation::DescriptorRead { address, .. }
        | Operation::DescriptorWrite { address, .. } => Some(address.address.clone()),
        _ => None,
    }
}

fn passes_filter(request: &ScanRequest, discovered: &DeviceDiscovered) -> bool {
    if let Some(floor) = request.rssi_floor {
        if discovered.rssi.is_none_or(|rssi| rssi < floor) {
            return false;
        }
    }
    if let Some(needle) = &request.name_filter {
        if !discovered
            .name
            .as_deref()
            .is_some_and(|name| name.contains(needle.as_str()))
        {
            return false;
        }
    }
    if request.scan_type == ScanType::Beacon {
        return discovered
            .advertisement_data
            .as_deref()
            .is_some_and(beacon::is_beacon);
    }
    true
}
