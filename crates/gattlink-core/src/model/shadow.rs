// ── Shadow documents ──

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::model::device::ConnectionEntry;

/// Desired state extracted from a shadow delta or get/accepted
/// snapshot. All fields optional; a delta carries only what changed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub desired_connections: Option<DesiredConnections>,
    pub beacons: Option<Vec<String>>,
    pub name: Option<String>,
    pub stage: Option<String>,
}

/// The two historical shapes of `desiredConnections`: a flat list of
/// device-id strings, or a list of `{id, ...}` objects.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DesiredConnections {
    Ids(Vec<String>),
    Entries(Vec<DesiredEntry>),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DesiredEntry {
    pub id: String,
    #[serde(flatten)]
    pub extra: Value,
}

impl DesiredConnections {
    /// Normalize both shapes to registry entries with default connect
    /// parameters, keeping the raw object payload when one was sent.
    pub fn to_entries(&self) -> Vec<ConnectionEntry> {
        match self {
            Self::Ids(ids) => ids
                .iter()
                .map(|id| ConnectionEntry::with_defaults(id.clone()))
                .collect(),
            Self::Entries(entries) => entries
                .iter()
                .map(|e| {
                    let mut entry = ConnectionEntry::with_defaults(e.id.clone());
                    entry.raw = json!({ "id": e.id, "extra": e.extra });
                    entry
                })
                .collect(),
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        match self {
            Self::Ids(ids) => ids.clone(),
            Self::Entries(entries) => entries.iter().map(|e| e.id.clone()).collect(),
        }
    }
}

impl DesiredState {
    /// Parse an `update/delta` payload: `{state: {...}}`.
    pub fn from_delta(payload: &[u8]) -> Result<Self, CoreError> {
        #[derive(Deserialize)]
        struct Delta {
            #[serde(default)]
            state: DesiredState,
        }
        Ok(serde_json::from_slice::<Delta>(payload)?.state)
    }

    /// Parse a `get/accepted` snapshot: `{state: {desired: {...}}}`.
    pub fn from_get_accepted(payload: &[u8]) -> Result<Self, CoreError> {
        #[derive(Deserialize)]
        struct Accepted {
            #[serde(default)]
            state: AcceptedState,
        }
        #[derive(Deserialize, Default)]
        struct AcceptedState {
            #[serde(default)]
            desired: DesiredState,
        }
        Ok(serde_json::from_slice::<Accepted>(payload)?.state.desired)
    }
}

// ── Status projection ────────────────────────────────────────────────

/// The `statusConnections` projection of the registry: `id → {id,
/// status: {connected}}`. Structural equality backs the
/// diff-before-publish rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusProjection(BTreeMap<String, StatusEntry>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub id: String,
    pub status: ConnectedFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedFlag {
    pub connected: bool,
}

impl StatusProjection {
    pub fn from_entries(entries: &[ConnectionEntry]) -> Self {
        Self(
            entries
                .iter()
                .map(|e| {
                    (
                        e.id.clone(),
                        StatusEntry {
                            id: e.id.clone(),
                            status: ConnectedFlag {
                                connected: e.status.connected,
                            },
                        },
                    )
                })
                .collect(),
        )
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// The reported-shadow fragment carrying this projection.
    pub fn to_reported_fragment(&self) -> Value {
        json!({ "statusConnections": self.0 })
    }
}

/// The reported-shadow fragment echoing the reconciled desired state
/// back to the cloud so it can confirm convergence.
pub fn reported_echo_fragment(
    desired_ids: &[String],
    name: Option<&str>,
    stage: &str,
) -> Value {
    let desired: Vec<Value> = desired_ids.iter().map(|id| json!({ "id": id })).collect();
    let mut fragment = json!({
        "desiredConnections": desired,
        "stage": stage,
        "connected": true,
        "device": {
            "deviceInfo": {
                "application": env!("CARGO_PKG_NAME"),
                "appVersion": env!("CARGO_PKG_VERSION"),
            },
        },
    });
    if let (Some(name), Some(obj)) = (name, fragment.as_object_mut()) {
        obj.insert("name".into(), json!(name));
    }
    fragment
}
