//! In-memory [`BleTransport`] used by the unit tests.

use crate::domain::models::Peripheral;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ChannelDescriptor, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Mutex<Vec<String>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_write_at: Mutex<Option<usize>>,
    reject_writes: Mutex<bool>,
    connect_error: Mutex<Option<TransportError>>,
    hang_connect: Mutex<bool>,
    channels: Mutex<Vec<ChannelDescriptor>>,
}

pub fn write_uuid() -> Uuid {
    protocol::WRITE_CHAR
}

pub fn notify_uuid() -> Uuid {
    protocol::NOTIFY_CHAR
}

pub fn default_channels() -> Vec<ChannelDescriptor> {
    let service_uuid = protocol::SERVICE;
    vec![
        ChannelDescriptor {
            uuid: write_uuid(),
            service_uuid,
            can_write: true,
            can_notify: false,
        },
        ChannelDescriptor {
            uuid: notify_uuid(),
            service_uuid,
            can_write: false,
            can_notify: true,
        },
    ]
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events: tx,
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            fail_write_at: Mutex::new(None),
            reject_writes: Mutex::new(false),
            connect_error: Mutex::new(None),
            hang_connect: Mutex::new(false),
            channels: Mutex::new(default_channels()),
        });
        (transport, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn discover(&self, id: &str, name: &str) {
        self.emit(TransportEvent::PeripheralDiscovered(Peripheral::new(id, name)));
    }

    /// Every write attempt, failed ones included
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Attempted writes joined back into text
    pub fn written_text(&self) -> String {
        let bytes: Vec<u8> = self.writes.lock().concat();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Complete messages written so far, one per line
    pub fn written_messages(&self) -> Vec<serde_json::Value> {
        self.written_text()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn fail_write_at(&self, index: usize) {
        *self.fail_write_at.lock() = Some(index);
    }

    /// Fail every write from now on
    pub fn reject_writes(&self) {
        *self.reject_writes.lock() = true;
    }

    pub fn fail_connect(&self, error: TransportError) {
        *self.connect_error.lock() = Some(error);
    }

    /// Make every connect attempt wait forever, like a peripheral that
    /// never answers
    pub fn hang_connect(&self) {
        *self.hang_connect.lock() = true;
    }

    pub fn set_channels(&self, channels: Vec<ChannelDescriptor>) {
        *self.channels.lock() = channels;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(name)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self, _service: Uuid) -> Result<(), TransportError> {
        self.record("start_scan".into());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record("stop_scan".into());
        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        self.record(format!("connect:{}", peripheral.id));
        let hang = *self.hang_connect.lock();
        if hang {
            std::future::pending::<()>().await;
        }
        match self.connect_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn discover_services(&self) -> Result<Vec<ChannelDescriptor>, TransportError> {
        self.record("discover_services".into());
        Ok(self.channels.lock().clone())
    }

    async fn write(&self, _channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let index = {
            let mut writes = self.writes.lock();
            writes.push(bytes.to_vec());
            writes.len() - 1
        };
        if *self.reject_writes.lock() || *self.fail_write_at.lock() == Some(index) {
            return Err(TransportError::LinkLost("write rejected".into()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Uuid) -> Result<(), TransportError> {
        self.record(format!("subscribe:{}", channel));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record("disconnect".into());
        Ok(())
    }
}
