// ── Cloud transport boundary ──
//
// The gateway consumes a pub/sub transport as a trait object. Session
// management, TLS, and reconnect policy belong to the implementation.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to the cloud")]
    NotConnected,

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Pub/sub channel to the cloud broker.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Subscribe to the inbound message stream. Every call returns a
    /// new independent receiver.
    fn messages(&self) -> broadcast::Receiver<TransportMessage>;
}

// ── Topics ───────────────────────────────────────────────────────────

/// The per-gateway topic family, derived from `(stage, tenant, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    stage: String,
    tenant_id: String,
    gateway_id: String,
}

impl TopicSet {
    pub fn new(
        stage: impl Into<String>,
        tenant_id: impl Into<String>,
        gateway_id: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    fn gateway_base(&self) -> String {
        format!(
            "{}/{}/gateways/{}",
            self.stage, self.tenant_id, self.gateway_id
        )
    }

    /// Cloud-to-gateway operations.
    pub fn c2g(&self) -> String {
        format!("{}/c2g", self.gateway_base())
    }

    /// Gateway-to-cloud events.
    pub fn g2c(&self) -> String {
        format!("{}/g2c", self.gateway_base())
    }

    fn shadow_base(&self) -> String {
        format!("$aws/things/{}/shadow", self.gateway_id)
    }

    pub fn shadow_get(&self) -> String {
        format!("{}/get", self.shadow_base())
    }

    pub fn shadow_get_accepted(&self) -> String {
        format!("{}/get/accepted", self.shadow_base())
    }

    pub fn shadow_update(&self) -> String {
        format!("{}/update", self.shadow_base())
    }

    pub fn shadow_update_delta(&self) -> String {
        format!("{}/update/delta", self.shadow_base())
    }

    fn fota_base(&self) -> String {
        format!("{}/jobs/ble", self.gateway_base())
    }

    /// Firmware job announcements from the cloud.
    pub fn fota_receive(&self) -> String {
        format!("{}/rcv", self.fota_base())
    }

    /// Request outstanding jobs for a device.
    pub fn fota_request(&self) -> String {
        format!("{}/req", self.fota_base())
    }

    /// Job status reports back to the cloud.
    pub fn fota_update(&self) -> String {
        format!("{}/update", self.fota_base())
    }
}
