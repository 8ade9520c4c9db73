//! BLE driver contracts for the gattlink gateway.
//!
//! The gateway never talks to a radio directly. It drives an
//! [`AdapterDriver`] for connections, scanning, and GATT access, and a
//! [`DfuDriver`] for firmware delivery. Concrete implementations wrap
//! whatever stack the host provides (a serialized dongle, a vendor HCI
//! bridge, a virtual adapter in tests); this crate only fixes the shapes
//! they all share.

pub mod dfu;
pub mod driver;
pub mod model;

pub use dfu::{DfuDriver, DfuProgress, DfuUpdate, UpdateArtifact, UpdateStatus};
pub use driver::{AdapterDriver, DriverError, DriverEvent, SecurityReplyStatus};
pub use model::{
    AdapterState, Address, AddressType, AuthStatus, Characteristic, CharacteristicProperties,
    ConnParams, ConnectOptions, Descriptor, DeviceDiscovered, KeyDistribution, ScanParams,
    ScanRequest, ScanType, Security, SecurityParams, Service,
};
