// ── BLE value types shared by the driver contract and the gateway ──
//
// Wire shapes follow the cloud data model (camelCase JSON); the
// parameter vocabulary follows the nRF connectivity stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Addresses ────────────────────────────────────────────────────────

/// BLE address type as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AddressType {
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "randomStatic")]
    RandomStatic,
    #[serde(rename = "randomPrivateResolvable")]
    RandomPrivateResolvable,
    #[serde(rename = "randomPrivateNonResolvable")]
    RandomPrivateNonResolvable,
}

/// A peer address. `kind` may be absent in cloud-originated lookups
/// (instance ids historically carried no address type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AddressType>,
}

impl Address {
    pub fn new(address: impl Into<String>, kind: AddressType) -> Self {
        Self {
            address: address.into(),
            kind: Some(kind),
        }
    }

    /// An address with no declared type, for lookups keyed on the bare
    /// address string.
    pub fn untyped(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: None,
        }
    }

    /// Wildcard match: when the *query* (`other`) has no address type,
    /// only the address strings are compared. Compatibility behavior —
    /// do not rely on it from new call sites.
    pub fn matches(&self, other: &Address) -> bool {
        if self.address != other.address {
            return false;
        }
        match other.kind {
            None => true,
            Some(kind) => self.kind == Some(kind),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}/{:?}", self.address, kind),
            None => write!(f, "{}", self.address),
        }
    }
}

// ── Connection parameters ────────────────────────────────────────────

/// Scan parameters used while hunting for the peer during connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u32,
    pub window: u32,
    pub timeout: u32,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: false,
            interval: 100,
            window: 50,
            timeout: 1,
        }
    }
}

/// Link-layer connection parameters (milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnParams {
    pub min_conn_interval: f64,
    pub max_conn_interval: f64,
    pub slave_latency: u32,
    pub connection_supervision_timeout: u32,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            min_conn_interval: 7.5,
            max_conn_interval: 7.5,
            slave_latency: 0,
            connection_supervision_timeout: 4000,
        }
    }
}

/// Which keys each side distributes during bonding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistribution {
    pub enc: bool,
    pub id: bool,
    pub sign: bool,
    pub link: bool,
}

/// Pairing capability set, used both to initiate pairing and to answer
/// a peer-initiated pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityParams {
    pub bond: bool,
    pub mitm: bool,
    pub lesc: bool,
    pub keypress: bool,
    pub io_caps: String,
    pub min_key_size: u8,
    pub max_key_size: u8,
    pub oob: bool,
    pub kdist_own: KeyDistribution,
    pub kdist_peer: KeyDistribution,
}

impl SecurityParams {
    /// The fixed low-capability parameter set the gateway answers with:
    /// no bonding, no MITM, no OOB, no key distribution.
    pub fn low_capability() -> Self {
        Self {
            bond: false,
            mitm: false,
            lesc: false,
            keypress: false,
            io_caps: "none".into(),
            min_key_size: 7,
            max_key_size: 16,
            oob: false,
            kdist_own: KeyDistribution::default(),
            kdist_peer: KeyDistribution::default(),
        }
    }
}

impl Default for SecurityParams {
    fn default() -> Self {
        Self::low_capability()
    }
}

/// Security posture for a desired connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    /// Initiate pairing after the link comes up.
    pub initiate: bool,
    /// Auto-accept peer-initiated pairing.
    pub auto_accept: bool,
    pub security_params: SecurityParams,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            initiate: false,
            auto_accept: true,
            security_params: SecurityParams::low_capability(),
        }
    }
}

/// Immutable per-desired-connection snapshot; replaced wholesale when
/// the cloud redeclares the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub scan_params: ScanParams,
    pub conn_params: ConnParams,
    pub security: Security,
}

// ── Authentication ───────────────────────────────────────────────────

/// Outcome of a pairing procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub description: String,
    pub status_code: i32,
    pub source: String,
    pub bonded: bool,
}

// ── Adapter state ────────────────────────────────────────────────────

/// Aggregate adapter status, polled by the scheduler before every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterState {
    pub available: bool,
    pub ble_enabled: bool,
    pub scanning: bool,
    pub advertising: bool,
    pub connecting: bool,
}

// ── Scanning ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    #[default]
    Regular,
    Beacon,
}

/// Parameters for a cloud-requested scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub active: bool,
    pub interval: u32,
    pub window: u32,
    pub timeout_secs: u32,
    /// Batch results up and deliver them all at scan end.
    pub batch: bool,
    /// Discard results weaker than this RSSI.
    pub rssi_floor: Option<i32>,
    /// Discard results whose advertised name lacks this substring.
    pub name_filter: Option<String>,
    pub scan_type: ScanType,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            active: false,
            interval: 100,
            window: 100,
            timeout_secs: 10,
            batch: false,
            rssi_floor: None,
            name_filter: None,
            scan_type: ScanType::Regular,
        }
    }
}

/// An advertisement observed during scanning (or a watched-device
/// sighting while connected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDiscovered {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub tx_power: Option<i32>,
    #[serde(default)]
    pub advertisement_type: Option<String>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Raw advertisement payload, used by the beacon-format filter.
    /// Travels as a plain JSON number array.
    #[serde(default)]
    pub advertisement_data: Option<Vec<u8>>,
}

// ── Attributes ───────────────────────────────────────────────────────

/// GATT characteristic property flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authorized_signed_write: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: String,
    #[serde(default)]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub properties: CharacteristicProperties,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: String,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
}
