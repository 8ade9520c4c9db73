// ── Firmware-update driver contract ──

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::driver::DriverError;

/// Lifecycle phases reported by a DFU run. The vocabulary is fixed by
/// the update protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    #[serde(rename = "connecting")]
    Connecting,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "dfuStarting")]
    DfuStarting,
    #[serde(rename = "dfuStarted")]
    DfuStarted,
    #[serde(rename = "enablingDfuMode")]
    EnablingDfuMode,
    #[serde(rename = "firmwareValidating")]
    FirmwareValidating,
    #[serde(rename = "deviceDisconnecting")]
    DeviceDisconnecting,
    #[serde(rename = "deviceDisconnected")]
    DeviceDisconnected,
    #[serde(rename = "dfuCompleted")]
    DfuCompleted,
    #[serde(rename = "dfuAborted")]
    DfuAborted,
    #[serde(rename = "progressChanged")]
    ProgressChanged,
}

/// Transfer progress attached to `ProgressChanged` updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuProgress {
    pub percent: u8,
    pub speed: f64,
    pub avg_speed: f64,
    pub current_part: u32,
    pub parts_total: u32,
}

/// One status update from an in-flight firmware delivery. A non-empty
/// `error` terminates the job as failed regardless of `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UpdateStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<DfuProgress>,
}

impl DfuUpdate {
    /// Whether this update ends the job.
    pub fn is_terminal(&self) -> bool {
        self.error.is_some()
            || matches!(
                self.status,
                Some(UpdateStatus::DfuCompleted | UpdateStatus::DfuAborted)
            )
    }
}

/// A packaged firmware update: the zip container plus the names of the
/// files inside it.
#[derive(Debug, Clone)]
pub struct UpdateArtifact {
    pub zip: Bytes,
    pub files: Vec<String>,
}

/// Delivers a packaged update to a peripheral. The returned channel
/// closes after a terminal update.
#[async_trait]
pub trait DfuDriver: Send + Sync {
    async fn start_update(
        &self,
        artifact: UpdateArtifact,
        device_id: &str,
    ) -> Result<mpsc::Receiver<DfuUpdate>, DriverError>;
}
