// ── Registry aggregates ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gattlink_ble::{Address, AddressType, AuthStatus, ConnectOptions};

/// Last connection-level failure reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionErrorInfo {
    pub code: i32,
    pub description: String,
}

/// Live status of one desired connection. `connecting` is a transient
/// lock preventing re-entrant attempts against the same device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    pub connect_timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectionErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStatus>,
}

/// Monotonic counters; reset only by full device removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatistics {
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connect: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DateTime<Utc>>,
    pub connect_count: u64,
    pub disconnect_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self {
            added_at: Utc::now(),
            last_connect: None,
            last_disconnect: None,
            connect_count: 0,
            disconnect_count: 0,
            rssi: None,
        }
    }
}

/// One desired connection and everything the gateway knows about it.
///
/// `raw` holds the last full cloud-side payload for the device and is
/// overwritten on every reconciliation, even when address and options
/// are unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub id: String,
    pub address: Address,
    pub connect_options: ConnectOptions,
    pub status: ConnectionStatus,
    pub statistics: ConnectionStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

impl ConnectionEntry {
    /// The default-parameter entry built from a bare device id during
    /// shadow reconciliation. Device ids are BLE addresses; the cloud
    /// does not declare an address type, static-random is assumed.
    pub fn with_defaults(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            address: Address::new(id.clone(), AddressType::RandomStatic),
            id,
            connect_options: ConnectOptions::default(),
            status: ConnectionStatus::default(),
            statistics: ConnectionStatistics::default(),
            device_name: None,
            raw: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_entry_starts_disconnected() {
        let entry = ConnectionEntry::with_defaults("AA:BB");
        assert_eq!(entry.id, "AA:BB");
        assert_eq!(entry.address.kind, Some(AddressType::RandomStatic));
        assert!(!entry.status.connected);
        assert!(!entry.status.connecting);
        assert_eq!(entry.statistics.connect_count, 0);
    }
}
