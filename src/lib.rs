//! BLE transport and application protocol for training targets.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{ConnectionState, LinkEvent, Peripheral, ProtocolMessage};
pub use infrastructure::bluetooth::{LinkConfig, LinkHandle, LinkService};
