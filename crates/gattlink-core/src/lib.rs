//! BLE-to-cloud gateway engine.
//!
//! A cloud "shadow" document names the peripherals the gateway should
//! keep connected. [`registry::ConnectionRegistry`] maintains those
//! connections with a round-robin reconnection scheduler,
//! [`engine::Gateway`] translates cloud operations into driver calls
//! and driver events into cloud documents, and [`fota::FotaPipeline`]
//! delivers multi-file firmware updates one device at a time.
//!
//! The BLE adapter, the update driver, the cloud transport, and the
//! credential store are all consumed as trait objects; see
//! `gattlink-ble` and `gattlink-config` for the contracts.

pub mod engine;
pub mod error;
pub mod facade;
pub mod fota;
pub mod model;
pub mod registry;
pub mod transport;

pub use engine::{Gateway, GatewayConfig, GatewayEvent};
pub use error::CoreError;
pub use facade::{CloudFacade, FotaStatus};
pub use fota::{FotaEvent, FotaJob, FotaPipeline};
pub use model::{ConnectionEntry, ConnectionStatus, Operation, StatusProjection};
pub use registry::{ConnectionRegistry, RegistryEvent};
pub use transport::{CloudTransport, TopicSet, TransportError, TransportMessage};
