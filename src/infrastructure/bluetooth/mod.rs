//! Bluetooth Module
//!
//! BLE link to a training target: scanning, connection, framed JSON
//! messaging and the image transfer protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 LinkService / LinkHandle                 │
//! │   (coordinator task - public API for the application)    │
//! └──────┬──────────────────┬───────────────────┬───────────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌─────────────┐   ┌───────────────┐   ┌────────────────┐
//! │    Link     │   │ ImageTransfer │   │  BleTransport  │
//! │             │   │    Engine     │   │                │
//! │ - framing   │◄──│ - master      │   │ - btleplug     │
//! │ - dispatch  │   │ - ready ACK   │   │ - mock (tests) │
//! │ - writer    │   │ - chunks      │   │                │
//! └─────────────┘   └───────────────┘   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, message vocabulary and outbound builders
//! - [`transport`] - Platform seam and its events
//! - [`btleplug_adapter`] - btleplug implementation of the transport
//! - [`framing`] - Brace-balanced frame reassembly
//! - [`dispatcher`] - Routing of inbound frames, forward listeners
//! - [`writer`] - Sequential chunked writes
//! - [`link`] - Connection-scoped state
//! - [`image_transfer`] - Image transfer session engine
//! - [`service`] - Coordinator

pub mod btleplug_adapter;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod image_transfer;
pub mod link;
#[cfg(test)]
mod mock;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod writer;

pub use btleplug_adapter::BtleplugTransport;
pub use error::{LinkError, TransferError};
pub use image_transfer::{TransferHandle, TransferPhase, TransferProgress};
pub use service::{LinkConfig, LinkHandle, LinkService};
pub use transport::{BleTransport, TransportError, TransportEvent};
