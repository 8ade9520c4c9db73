// ── Cloud facade ──
//
// Every outbound document goes through here: the facade wraps events in
// the g2c envelope, stamps the monotonically increasing messageId, and
// publishes best-effort. Publish failures are logged, never retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::model::g2c::G2cEvent;
use crate::transport::{CloudTransport, TopicSet};

/// Job status vocabulary for FOTA status tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaStatus {
    Downloading,
    InProgress,
    Failed,
    Succeeded,
}

impl FotaStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }
}

pub struct CloudFacade {
    transport: Arc<dyn CloudTransport>,
    gateway_id: String,
    topics: Mutex<TopicSet>,
    message_id: AtomicU64,
}

impl CloudFacade {
    pub fn new(transport: Arc<dyn CloudTransport>, gateway_id: impl Into<String>, topics: TopicSet) -> Self {
        Self {
            transport,
            gateway_id: gateway_id.into(),
            topics: Mutex::new(topics),
            message_id: AtomicU64::new(0),
        }
    }

    pub async fn topics(&self) -> TopicSet {
        self.topics.lock().await.clone()
    }

    /// Swap the topic family after a stage change. The caller handles
    /// re-subscription.
    pub async fn set_topics(&self, topics: TopicSet) {
        *self.topics.lock().await = topics;
    }

    fn next_message_id(&self) -> u64 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish_json(&self, topic: String, mut document: Value) {
        if let Some(obj) = document.as_object_mut() {
            obj.insert("messageId".into(), json!(self.next_message_id()));
        }
        let payload = Bytes::from(document.to_string());
        if let Err(e) = self.transport.publish(&topic, payload).await {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }

    /// Publish a g2c event, wrapped in the event envelope.
    pub async fn publish_event(&self, event: &G2cEvent, request_id: Option<&str>) {
        let mut inner = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        if let Some(obj) = inner.as_object_mut() {
            obj.insert("timestamp".into(), json!(Utc::now().timestamp_millis()));
        }
        let mut envelope = json!({
            "type": "event",
            "gatewayId": self.gateway_id,
            "event": inner,
        });
        if let (Some(id), Some(obj)) = (request_id, envelope.as_object_mut()) {
            obj.insert("requestId".into(), json!(id));
        }
        let topic = self.topics.lock().await.g2c();
        self.publish_json(topic, envelope).await;
    }

    /// Best-effort informational error event.
    pub async fn publish_error(&self, description: &str, code: i32, device_id: Option<&str>) {
        let mut document = json!({
            "type": "error",
            "gatewayId": self.gateway_id,
            "error": { "description": description, "code": code },
        });
        if let (Some(id), Some(obj)) = (device_id, document.as_object_mut()) {
            obj.insert("device".into(), json!({ "id": id }));
        }
        let topic = self.topics.lock().await.g2c();
        self.publish_json(topic, document).await;
    }

    /// Publish a reported-shadow fragment.
    pub async fn publish_shadow_reported(&self, fragment: Value) {
        let topic = self.topics.lock().await.shadow_update();
        self.publish_json(topic, json!({ "state": { "reported": fragment } }))
            .await;
    }

    /// Trigger a shadow snapshot; the answer arrives on get/accepted.
    pub async fn publish_shadow_get(&self) {
        let topic = self.topics.lock().await.shadow_get();
        if let Err(e) = self.transport.publish(&topic, Bytes::new()).await {
            warn!(topic = %topic, error = %e, "shadow get failed");
        }
    }

    /// Report a FOTA job status tuple.
    pub async fn publish_fota_status(
        &self,
        device_id: &str,
        job_id: &str,
        status: FotaStatus,
        detail: Option<&str>,
    ) {
        debug!(device = %device_id, job = %job_id, status = status.as_str(), "fota status");
        let topic = self.topics.lock().await.fota_update();
        let tuple = json!([device_id, job_id, status.as_str(), detail.unwrap_or("")]);
        if let Err(e) = self.transport.publish(&topic, Bytes::from(tuple.to_string())).await {
            warn!(topic = %topic, error = %e, "fota status publish failed");
        }
    }

    /// Advertise firmware-update capability in the reported shadow.
    pub async fn report_fota_support(&self) {
        self.publish_shadow_reported(json!({
            "device": { "serviceInfo": { "fota_v2": ["APP", "MODEM", "BOOT"] } },
        }))
        .await;
    }

    /// Ask the cloud for outstanding jobs for a freshly connected
    /// device.
    pub async fn request_jobs(&self, device_id: &str) {
        let topic = self.topics.lock().await.fota_request();
        let payload = Bytes::from(json!([device_id]).to_string());
        if let Err(e) = self.transport.publish(&topic, payload).await {
            warn!(topic = %topic, error = %e, "job request publish failed");
        }
    }
}
