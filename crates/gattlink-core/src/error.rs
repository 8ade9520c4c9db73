use thiserror::Error;

use crate::transport::TransportError;
use gattlink_ble::DriverError;
use gattlink_config::ConfigError;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("already started")]
    AlreadyStarted,

    #[error("BLE is already enabled; refusing to start from an unknown adapter state")]
    BleAlreadyEnabled,

    /// Duplicate registration of a driver event listener. Programmer
    /// error; aborts startup.
    #[error("listener already registered for event '{event}'")]
    ListenerAlreadyRegistered { event: &'static str },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("attribute not found at path '{path}'")]
    AttributeNotFound { path: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("download of {uri} failed: {reason}")]
    Download { uri: String, reason: String },

    /// A downloaded file vanished from the cache before packaging.
    #[error("downloaded file missing at packaging time: {uri}")]
    MissingDownload { uri: String },

    #[error("artifact packaging failed: {0}")]
    Packaging(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
