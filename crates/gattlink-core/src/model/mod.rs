//! Wire documents and registry aggregates.

pub mod attributes;
pub mod beacon;
pub mod c2g;
pub mod device;
pub mod g2c;
pub mod shadow;

pub use attributes::{AttributePath, DiscoveredAttributes};
pub use c2g::{Operation, OperationRequest};
pub use device::{ConnectionEntry, ConnectionErrorInfo, ConnectionStatistics, ConnectionStatus};
pub use g2c::G2cEvent;
pub use shadow::{DesiredConnections, DesiredState, StatusProjection};
