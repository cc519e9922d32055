use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A BLE peripheral seen while scanning.
///
/// The platform handle stays inside the transport adapter, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ServicesDiscovering,
    Ready,
    Error(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// True while a connection attempt is underway or established.
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServicesDiscovering | Self::Ready
        )
    }
}

/// A device on the target's local network, as reported by a device-list message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub name: String,
    pub mode: String,
}

/// A hit reported by a target.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShotRecord {
    pub device: Option<String>,
    pub zone: Option<String>,
    pub score: Option<i64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub timestamp: Option<i64>,
}

/// A `netlink`/`forward` frame handed to every registered forward listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardMessage {
    /// The complete decoded frame, top-level keys included.
    pub frame: Value,
}

impl ForwardMessage {
    pub fn content(&self) -> &Value {
        self.frame.get("content").unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OtaNotice {
    ReadyToDownload,
    DownloadComplete,
    VersionInfo(String),
    PrepareSucceeded,
    PrepareFailed {
        reason: String,
        game_disk_missing: bool,
    },
}

/// A decoded inbound message, one variant per routed category.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    AuthData(Value),
    DeviceListError(String),
    DeviceList(Vec<NetworkDevice>),
    Forward(ForwardMessage),
    Shot(ShotRecord),
    ProvisionComplete,
    WifiSsidRequest,
    WorkMode(String),
    ProvisionStatus(String),
    Ota(OtaNotice),
}

/// Everything the link publishes to its subscribers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    ScanStarted,
    ScanStopped,
    PeripheralDiscovered(Peripheral),
    /// More than one candidate answered a scan; the caller picks one with `connect`.
    DevicePickerRequested(Vec<Peripheral>),
    Message(ProtocolMessage),
    TransferProgress { percent: u8 },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
