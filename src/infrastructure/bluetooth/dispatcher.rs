//! Message Dispatcher
//!
//! Turns complete frames into [`ProtocolMessage`]s. Routing walks an ordered
//! route table and stops at the first match: several legacy shapes overlap,
//! so the order of [`ROUTES`] is part of the protocol.
//!
//! Decoding never fails past this boundary. Missing keys become defaults,
//! frames that do not parse are logged and dropped, frames no route claims
//! are ignored.

use crate::domain::models::{
    ForwardMessage, LinkEvent, NetworkDevice, OtaNotice, ProtocolMessage, ShotRecord,
};
use crate::infrastructure::bluetooth::protocol::{action, kind, MASTER_MODE};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// A decoded frame before routing
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub kind: Option<String>,
    pub action: Option<String>,
    pub content: Value,
    pub frame: Value,
}

impl MessageEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let frame: Value = serde_json::from_str(text)?;
        let field = |key: &str| frame.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            kind: field("type"),
            action: field("action"),
            content: frame.get("content").cloned().unwrap_or(Value::Null),
            frame,
        })
    }

    fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    fn action_is(&self, action: &str) -> bool {
        self.action.as_deref() == Some(action)
    }

    fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

struct Route {
    name: &'static str,
    matches: fn(&MessageEnvelope) -> bool,
    decode: fn(&MessageEnvelope) -> Option<ProtocolMessage>,
}

const ROUTES: &[Route] = &[
    Route {
        name: "auth_data",
        matches: |env: &MessageEnvelope| env.is(kind::AUTH_DATA) && !env.content.is_null(),
        decode: |env: &MessageEnvelope| Some(ProtocolMessage::AuthData(env.content.clone())),
    },
    Route {
        name: "device_list_failure",
        matches: |env: &MessageEnvelope| {
            env.is(kind::NOTICE)
                && env.action_is(action::QUERY_DEVICE_LIST)
                && env.content.get("result").map(is_failure).unwrap_or(false)
        },
        decode: |env: &MessageEnvelope| {
            let message = env
                .content_str("message")
                .or_else(|| env.content_str("reason"))
                .unwrap_or("Failed to query network devices");
            Some(ProtocolMessage::DeviceListError(message.to_string()))
        },
    },
    Route {
        name: "device_list",
        matches: |env: &MessageEnvelope| env.is(kind::NETLINK) && env.action_is(action::DEVICE_LIST),
        decode: |env: &MessageEnvelope| Some(ProtocolMessage::DeviceList(parse_devices(&env.content))),
    },
    Route {
        name: "netlink_forward",
        matches: |env: &MessageEnvelope| env.is(kind::NETLINK) && env.action_is(action::FORWARD),
        decode: |env: &MessageEnvelope| {
            Some(ProtocolMessage::Forward(ForwardMessage {
                frame: env.frame.clone(),
            }))
        },
    },
    Route {
        name: "ota_prepare",
        matches: |env: &MessageEnvelope| env.is(kind::NOTICE) && env.action_is(action::OTA_PREPARE),
        decode: |env: &MessageEnvelope| Some(ProtocolMessage::Ota(decode_ota_prepare(&env.content))),
    },
    Route {
        name: "forward",
        matches: |env: &MessageEnvelope| {
            env.is(kind::FORWARD) || (env.kind.is_none() && env.action_is(action::FORWARD))
        },
        decode: decode_forward,
    },
    Route {
        name: "download_complete",
        matches: |env: &MessageEnvelope| {
            env.frame.get("notification").and_then(Value::as_str) == Some("download_complete")
        },
        decode: |_: &MessageEnvelope| Some(ProtocolMessage::Ota(OtaNotice::DownloadComplete)),
    },
    Route {
        name: "version",
        matches: |env: &MessageEnvelope| env.is(kind::VERSION),
        decode: |env: &MessageEnvelope| {
            let version = env
                .content_str("version")
                .or_else(|| env.frame.get("version").and_then(Value::as_str))
                .unwrap_or_default();
            Some(ProtocolMessage::Ota(OtaNotice::VersionInfo(version.to_string())))
        },
    },
];

/// Classify an envelope without side effects.
pub fn route(envelope: &MessageEnvelope) -> Option<ProtocolMessage> {
    let route = ROUTES.iter().find(|r| (r.matches)(envelope))?;
    trace!("Frame matched route '{}'", route.name);
    (route.decode)(envelope)
}

fn is_failure(value: &Value) -> bool {
    match value {
        Value::Bool(ok) => !ok,
        Value::String(s) => matches!(
            s.to_lowercase().as_str(),
            "fail" | "failed" | "failure" | "error"
        ),
        _ => false,
    }
}

fn parse_devices(content: &Value) -> Vec<NetworkDevice> {
    let entries = content
        .get("devices")
        .or_else(|| content.get("device_list"))
        .unwrap_or(content);

    entries
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(Value::as_str)?;
                    let mode = entry.get("mode").and_then(Value::as_str).unwrap_or_default();
                    Some(NetworkDevice {
                        name: name.to_string(),
                        mode: mode.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode_ota_prepare(content: &Value) -> OtaNotice {
    let failed = content.get("result").map(is_failure).unwrap_or(false);
    if !failed {
        return OtaNotice::PrepareSucceeded;
    }
    let reason = content
        .get("reason")
        .or_else(|| content.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let game_disk_missing = reason.to_lowercase().contains("game disk not found");
    OtaNotice::PrepareFailed {
        reason,
        game_disk_missing,
    }
}

fn decode_forward(env: &MessageEnvelope) -> Option<ProtocolMessage> {
    if let Some(state) = env.content_str("provision") {
        if matches!(state, "done" | "success") {
            return Some(ProtocolMessage::ProvisionComplete);
        }
    }
    if env.content_str("command") == Some("request_wifi_ssid") {
        return Some(ProtocolMessage::WifiSsidRequest);
    }
    if let Some(mode) = env.content_str("work_mode") {
        return Some(ProtocolMessage::WorkMode(mode.to_string()));
    }
    if let Some(status) = env.content_str("provision_status") {
        return Some(ProtocolMessage::ProvisionStatus(status.to_string()));
    }
    match env.content_str("notification") {
        Some("ready_to_download") => return Some(ProtocolMessage::Ota(OtaNotice::ReadyToDownload)),
        Some("download_complete") => return Some(ProtocolMessage::Ota(OtaNotice::DownloadComplete)),
        _ => {}
    }
    if let Some(version) = env.content_str("version") {
        return Some(ProtocolMessage::Ota(OtaNotice::VersionInfo(version.to_string())));
    }
    if env.content_str("type") == Some(kind::VERSION) {
        return Some(ProtocolMessage::Ota(OtaNotice::VersionInfo(String::new())));
    }
    None
}

/// Decode a shot carried by a forwarded frame, if it is one.
pub fn decode_shot(content: &Value) -> Option<ShotRecord> {
    if content.get("command").and_then(Value::as_str) != Some("shot") {
        return None;
    }
    let data = content.get("data").filter(|d| d.is_object()).unwrap_or(content);
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| data.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };
    Some(ShotRecord {
        device: text(&["device", "from"]),
        zone: text(&["zone", "area"]),
        score: data.get("score").and_then(Value::as_i64),
        x: data.get("x").and_then(Value::as_f64),
        y: data.get("y").and_then(Value::as_f64),
        timestamp: data
            .get("timestamp")
            .or_else(|| data.get("ts"))
            .and_then(Value::as_i64),
    })
}

type ListenerTable = HashMap<u64, mpsc::UnboundedSender<ForwardMessage>>;

/// Registry of forward-message subscribers. Any number may listen at once.
#[derive(Default, Clone)]
pub struct ForwardListeners {
    table: Arc<Mutex<(u64, ListenerTable)>>,
}

impl ForwardListeners {
    pub fn register(&self) -> ForwardSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.table.lock();
        let id = guard.0;
        guard.0 += 1;
        guard.1.insert(id, tx);
        ForwardSubscription {
            id,
            table: self.table.clone(),
            receiver: rx,
        }
    }

    fn broadcast(&self, message: &ForwardMessage) {
        let mut guard = self.table.lock();
        guard.1.retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.table.lock().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered forward listener; unregisters itself when dropped.
pub struct ForwardSubscription {
    id: u64,
    table: Arc<Mutex<(u64, ListenerTable)>>,
    receiver: mpsc::UnboundedReceiver<ForwardMessage>,
}

impl ForwardSubscription {
    pub async fn recv(&mut self) -> Option<ForwardMessage> {
        self.receiver.recv().await
    }
}

impl Drop for ForwardSubscription {
    fn drop(&mut self) {
        self.table.lock().1.remove(&self.id);
    }
}

pub struct MessageDispatcher {
    devices: RwLock<Vec<NetworkDevice>>,
    forward_listeners: ForwardListeners,
    events: broadcast::Sender<LinkEvent>,
}

impl MessageDispatcher {
    pub fn new(events: broadcast::Sender<LinkEvent>) -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            forward_listeners: ForwardListeners::default(),
            events,
        }
    }

    /// Decode one frame, apply its effects and publish it.
    pub fn dispatch(&self, frame: &str) -> Option<ProtocolMessage> {
        let envelope = match MessageEnvelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping unparseable frame: {} ({} bytes)", e, frame.len());
                return None;
            }
        };

        let Some(message) = route(&envelope) else {
            trace!(
                "Ignoring frame type={:?} action={:?}",
                envelope.kind,
                envelope.action
            );
            return None;
        };
        debug!("Received {:?}", message);

        match &message {
            ProtocolMessage::DeviceList(devices) => {
                *self.devices.write() = devices.clone();
            }
            ProtocolMessage::Forward(forward) => {
                self.forward_listeners.broadcast(forward);
                if let Some(shot) = decode_shot(forward.content()) {
                    self.publish(ProtocolMessage::Shot(shot));
                }
            }
            _ => {}
        }

        self.publish(message.clone());
        Some(message)
    }

    fn publish(&self, message: ProtocolMessage) {
        // No subscribers is not an error
        let _ = self.events.send(LinkEvent::Message(message));
    }

    pub fn network_devices(&self) -> Vec<NetworkDevice> {
        self.devices.read().clone()
    }

    /// The device forwarded messages must be addressed to. Devices in any
    /// other mode are never returned.
    pub fn master_device(&self) -> Option<NetworkDevice> {
        self.devices
            .read()
            .iter()
            .find(|d| d.mode == MASTER_MODE)
            .cloned()
    }

    /// Forget the snapshot reported by a peripheral that is gone
    pub(crate) fn clear_devices(&self) {
        self.devices.write().clear();
    }

    pub fn register_forward_listener(&self) -> ForwardSubscription {
        self.forward_listeners.register()
    }

    pub fn forward_listener_count(&self) -> usize {
        self.forward_listeners.len()
    }
}
