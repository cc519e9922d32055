//! BLE Transport Adapter
//!
//! The only seam that touches platform Bluetooth primitives. Implementations
//! perform I/O and report what happened as [`TransportEvent`]s; they never
//! parse messages or hold link state of their own.

use crate::domain::models::Peripheral;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("Bluetooth radio is off")]
    RadioOff,
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection attempt timed out")]
    ConnectTimeout,
    #[error("Channel not found: {0}")]
    ChannelNotFound(Uuid),
    #[error("Link lost: {0}")]
    LinkLost(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

/// A characteristic located on the connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub can_write: bool,
    pub can_notify: bool,
}

/// Events reported by the transport, delivered in order on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeripheralDiscovered(Peripheral),
    /// A fragment received on a subscribed channel
    Notification(Vec<u8>),
    /// The link went down. `error` is set when it was not requested.
    Disconnected { error: Option<String> },
    /// Radio power changed
    AdapterPowered(bool),
}

#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning for peripherals advertising `service`
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &Peripheral) -> Result<(), TransportError>;

    /// List the characteristics of the connected peripheral
    async fn discover_services(&self) -> Result<Vec<ChannelDescriptor>, TransportError>;

    /// Write with response; resolves once the platform reports completion
    async fn write(&self, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
