// ── Adapter driver contract ──
//
// The gateway owns exactly one driver. All state changes flow back
// through the broadcast event stream; method return values only carry
// the immediate result of the call.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{
    AdapterState, Address, AuthStatus, Characteristic, ConnectOptions, Descriptor,
    DeviceDiscovered, ScanRequest, SecurityParams, Service,
};

/// Errors surfaced by an adapter driver implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("adapter is not open")]
    NotOpen,

    #[error("device not connected: {0}")]
    NotConnected(Address),

    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: Address, reason: String },

    #[error("attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("scan already in progress")]
    ScanInProgress,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("adapter failure: {0}")]
    Adapter(String),
}

/// Reply status for a peer-initiated security parameters request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityReplyStatus {
    Success,
    Rejected,
}

/// Events emitted by the adapter on its broadcast stream.
///
/// Addresses identify the peer the event concerns. Value-changed events
/// carry the composite attribute path alongside the refreshed attribute.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DriverEvent {
    AdapterStateChange(AdapterState),
    AdapterError(String),
    AdapterWarning(String),

    DeviceDiscovered(DeviceDiscovered),
    /// Batched results delivered at the end of a batched scan.
    DevicesDiscovered(Vec<DeviceDiscovered>),
    ScanTimedOut,

    ConnectionUp(Address),
    ConnectionDown(Address),
    ConnectTimedOut(Address),
    ConnectCanceled(Address),
    ConnectionError {
        address: Address,
        description: String,
        code: i32,
    },

    /// Peer asked us to initiate security; answer with `authenticate`.
    ConnectionSecurityRequest {
        address: Address,
        params: SecurityParams,
    },
    /// Peer sent pairing parameters; answer with
    /// `security_parameters_reply`.
    ConnectionSecurityParametersRequest {
        address: Address,
        params: SecurityParams,
    },
    ConnectionAuthenticationStatus {
        address: Address,
        status: AuthStatus,
    },

    CharacteristicValueChanged {
        address: Address,
        path: String,
        characteristic: Characteristic,
    },
    DescriptorValueChanged {
        address: Address,
        path: String,
        descriptor: Descriptor,
    },
}

/// The BLE adapter surface the gateway drives.
///
/// Implementations wrap a concrete stack (serialized dongle, HCI
/// bridge, virtual adapter). Methods return once the operation is
/// submitted; completion arrives on the event stream.
#[async_trait]
pub trait AdapterDriver: Send + Sync {
    /// Bring the adapter up. Idempotent.
    async fn open(&self) -> Result<(), DriverError>;

    /// Tear the adapter down, dropping every connection.
    async fn close(&self) -> Result<(), DriverError>;

    /// Hard reset. Connections drop and re-enable follows.
    async fn reset(&self) -> Result<(), DriverError>;

    /// Initiate a connection. Returns the resolved peer address (the
    /// driver may fill in the address type).
    async fn connect(
        &self,
        address: &Address,
        options: &ConnectOptions,
    ) -> Result<Address, DriverError>;

    async fn disconnect(&self, address: &Address) -> Result<(), DriverError>;

    /// Initiate pairing with the given capability set.
    async fn authenticate(
        &self,
        address: &Address,
        params: &SecurityParams,
    ) -> Result<(), DriverError>;

    /// Answer a [`DriverEvent::ConnectionSecurityParametersRequest`].
    async fn security_parameters_reply(
        &self,
        address: &Address,
        status: SecurityReplyStatus,
        params: Option<&SecurityParams>,
    ) -> Result<(), DriverError>;

    /// Parameters the adapter answers with when no per-connection set
    /// applies.
    async fn set_default_security_parameters(
        &self,
        params: &SecurityParams,
    ) -> Result<(), DriverError>;

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), DriverError>;

    async fn stop_scan(&self) -> Result<(), DriverError>;

    /// Run service discovery against a connected peer, reading initial
    /// values.
    async fn get_attributes(&self, address: &Address) -> Result<Vec<Service>, DriverError>;

    async fn read_characteristic_value(
        &self,
        address: &Address,
        path: &str,
    ) -> Result<Vec<u8>, DriverError>;

    async fn write_characteristic_value(
        &self,
        address: &Address,
        path: &str,
        value: &[u8],
        ack: bool,
    ) -> Result<(), DriverError>;

    async fn read_descriptor_value(
        &self,
        address: &Address,
        path: &str,
    ) -> Result<Vec<u8>, DriverError>;

    async fn write_descriptor_value(
        &self,
        address: &Address,
        path: &str,
        value: &[u8],
        ack: bool,
    ) -> Result<(), DriverError>;

    /// Report advertisement sightings of these addresses as
    /// [`DriverEvent::DeviceDiscovered`] even outside an active scan.
    async fn watch_devices(&self, addresses: Vec<String>) -> Result<(), DriverError>;

    async fn unwatch_devices(&self, addresses: Vec<String>) -> Result<(), DriverError>;

    async fn get_state(&self) -> AdapterState;

    /// Subscribe to the adapter event stream. Every call returns a new
    /// independent receiver.
    fn events(&self) -> broadcast::Receiver<DriverEvent>;
}
