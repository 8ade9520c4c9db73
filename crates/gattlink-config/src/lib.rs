//! Credential and configuration persistence.
//!
//! The gateway treats its configuration as an opaque blob behind the
//! narrow [`ConfigStore`] contract so embedders can back it with a
//! file, a secure element, or anything else. [`FsConfigStore`] is the
//! stock filesystem implementation; [`Credentials`] is the document the
//! gateway itself stores there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// ── Store contract ───────────────────────────────────────────────────

/// Opaque blob persistence. `read` on a store that holds nothing must
/// return an empty JSON object, not fail.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read(&self) -> Result<String, ConfigError>;
    async fn write(&self, contents: &str) -> Result<(), ConfigError>;
    async fn exists(&self) -> bool;
    /// Remove the stored blob. Succeeds if nothing is stored.
    async fn unlink(&self) -> Result<(), ConfigError>;
}

/// File-backed store. The file is created holding `{}` the first time
/// it is read.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    path: PathBuf,
}

impl FsConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn ensure_exists(&self) -> Result<(), ConfigError> {
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| self.io_err(e))?
        {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        debug!(path = %self.path.display(), "creating empty config file");
        tokio::fs::write(&self.path, "{}")
            .await
            .map_err(|e| self.io_err(e))
    }
}

#[async_trait]
impl ConfigStore for FsConfigStore {
    async fn read(&self) -> Result<String, ConfigError> {
        self.ensure_exists().await?;
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_err(e))
    }

    async fn write(&self, contents: &str) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| self.io_err(e))
    }

    async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn unlink(&self) -> Result<(), ConfigError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

// ── Credential document ──────────────────────────────────────────────

/// The gateway's stored identity and cloud credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credentials {
    pub gateway_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl Credentials {
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        Self::from_json(&store.read().await?)
    }

    pub async fn save(&self, store: &dyn ConfigStore) -> Result<(), ConfigError> {
        store.write(&self.to_json()?).await
    }
}
