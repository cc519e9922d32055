//! Target Wire Protocol
//!
//! GATT identifiers, message vocabulary and builders for the outbound JSON
//! messages understood by the target.
//!
//! Every message is one UTF-8 JSON object terminated by `\n`. There is no
//! length prefix; the receiving side frames by brace balance. Objects are
//! built from `serde_json::Map`, which keeps keys in alphabetical order, so
//! the encoded text is byte-for-byte reproducible.

use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Primary service UUID, also used as the advertisement scan filter
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Write characteristic UUID - where commands are sent
pub const WRITE_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Notify characteristic UUID - where messages are received
pub const NOTIFY_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

pub const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const WRITE_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Mode reported by the network device that accepts forwarded messages
pub const MASTER_MODE: &str = "master";

/// Inbound `type` values
pub mod kind {
    pub const AUTH_DATA: &str = "auth_data";
    pub const NOTICE: &str = "notice";
    pub const NETLINK: &str = "netlink";
    pub const FORWARD: &str = "forward";
    pub const VERSION: &str = "version";
}

/// Inbound and outbound `action` values
pub mod action {
    pub const QUERY_DEVICE_LIST: &str = "netlink_query_device_list";
    pub const DEVICE_LIST: &str = "device_list";
    pub const FORWARD: &str = "forward";
    pub const NETLINK_FORWARD: &str = "netlink_forward";
    pub const OTA_PREPARE: &str = "ota_prepare";
    pub const QUERY_VERSION: &str = "query_version";
}

/// Image transfer vocabulary carried in `netlink_forward` content
pub mod image {
    pub const READY: &str = "image_ready";
    pub const START: &str = "image_start";
    pub const CHUNK: &str = "image_chunk";
    pub const END: &str = "image_end";
    /// Key holding the acknowledgement token, at top level or inside `content`
    pub const ACK_KEY: &str = "ack";
}

/// Simple commands addressed to the connected peripheral itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCommand {
    /// Ask the peripheral for its firmware version, sent on every new connection
    QueryVersion,
    /// Ask the peripheral for the devices on its network
    QueryDeviceList,
}

impl TargetCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::QueryVersion => action::QUERY_VERSION,
            Self::QueryDeviceList => action::QUERY_DEVICE_LIST,
        }
    }

    /// `{"action":"<verb>"}`
    pub fn to_json(&self) -> String {
        json!({ "action": self.action() }).to_string()
    }
}

/// `{"action":"forward","content":{...}}`
pub fn forward(content: Map<String, Value>) -> String {
    json!({ "action": action::FORWARD, "content": Value::Object(content) }).to_string()
}

/// `{"action":"netlink_forward","content":{...},"dest":"<device name>"}`
pub fn netlink_forward(dest: &str, content: Map<String, Value>) -> String {
    json!({
        "action": action::NETLINK_FORWARD,
        "content": Value::Object(content),
        "dest": dest,
    })
    .to_string()
}

/// Reply to a WiFi SSID request during provisioning
pub fn wifi_credentials(ssid: &str, password: &str) -> String {
    let mut content = Map::new();
    content.insert("password".into(), password.into());
    content.insert("ssid".into(), ssid.into());
    forward(content)
}

pub fn image_ready() -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("command".into(), image::READY.into());
    content
}

pub fn image_start(
    name: &str,
    chunk_size: usize,
    total_chunks: usize,
    total_size: usize,
) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("chunk_size".into(), chunk_size.into());
    content.insert("command".into(), image::START.into());
    content.insert("name".into(), name.into());
    content.insert("total_chunks".into(), total_chunks.into());
    content.insert("total_size".into(), total_size.into());
    content
}

pub fn image_chunk(index: usize, encoded: String) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("command".into(), image::CHUNK.into());
    content.insert("data".into(), encoded.into());
    content.insert("index".into(), index.into());
    content
}

pub fn image_end() -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("command".into(), image::END.into());
    content.insert("status".into(), "complete".into());
    content
}

/// True when a forwarded frame acknowledges the image ready-request.
pub fn is_image_ready_ack(frame: &Value) -> bool {
    let token = |v: &Value| v.get(image::ACK_KEY).and_then(Value::as_str) == Some(image::READY);
    token(frame) || frame.get("content").map(token).unwrap_or(false)
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(uuid_str.trim())
}
