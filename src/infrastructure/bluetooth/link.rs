//! Connection-scoped link state
//!
//! Holds what exists only while a peripheral is connected (channels, the
//! write scheduler, the frame buffer) alongside the process-wide
//! [`ConnectionState`]. The coordinator attaches and detaches connections;
//! everyone else reads state and sends through here.

use crate::domain::models::{ConnectionState, LinkEvent, Peripheral};
use crate::infrastructure::bluetooth::dispatcher::MessageDispatcher;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::framing::FrameReassembler;
use crate::infrastructure::bluetooth::protocol::TargetCommand;
use crate::infrastructure::bluetooth::writer::WriteScheduler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub(crate) struct ActiveConnection {
    pub peripheral: Peripheral,
    pub write_channel: Uuid,
    pub notify_channel: Uuid,
    pub writer: WriteScheduler,
}

struct Session {
    connection: Option<ActiveConnection>,
    reassembler: FrameReassembler,
}

pub struct Link {
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    dispatcher: MessageDispatcher,
    events: broadcast::Sender<LinkEvent>,
    generation: AtomicU64,
}

impl Link {
    pub fn new(events: broadcast::Sender<LinkEvent>, frame_buffer_cap: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            session: Mutex::new(Session {
                connection: None,
                reassembler: FrameReassembler::new(frame_buffer_cap),
            }),
            dispatcher: MessageDispatcher::new(events.clone()),
            events,
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Ready with a live write channel
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_ready() && self.session.lock().connection.is_some()
    }

    pub fn peripheral(&self) -> Option<Peripheral> {
        self.session
            .lock()
            .connection
            .as_ref()
            .map(|c| c.peripheral.clone())
    }

    /// Bumped on every attach and detach
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
            self.publish(LinkEvent::StateChanged(state));
        }
    }

    /// Set `state` unless a detach or attach happened since `generation`
    /// was read. Returns whether the state was applied.
    pub(crate) fn set_state_on(&self, generation: u64, state: ConnectionState) -> bool {
        let _session = self.session.lock();
        if self.generation() != generation {
            return false;
        }
        self.set_state(state);
        true
    }

    pub(crate) fn publish(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn attach(&self, connection: ActiveConnection) -> u64 {
        let mut session = self.session.lock();
        debug!(
            "Attached {} (write {}, notify {})",
            connection.peripheral.name, connection.write_channel, connection.notify_channel
        );
        session.reassembler.clear();
        session.connection = Some(connection);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop everything connection-scoped in one critical section.
    ///
    /// Shutting the write scheduler down fails every queued write.
    pub(crate) fn detach(&self) -> Option<Peripheral> {
        let mut session = self.session.lock();
        session.reassembler.clear();
        self.dispatcher.clear_devices();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let connection = session.connection.take()?;
        connection.writer.shutdown();
        Some(connection.peripheral)
    }

    /// Feed a notification fragment; complete frames are dispatched in order.
    pub fn ingest(&self, fragment: &[u8]) {
        let frames = {
            let mut session = self.session.lock();
            if session.connection.is_none() {
                trace!("Dropping {} byte(s) received while detached", fragment.len());
                return;
            }
            session.reassembler.push(fragment)
        };
        for frame in frames {
            self.dispatcher.dispatch(&frame);
        }
    }

    pub async fn write_json(&self, text: &str) -> Result<(), LinkError> {
        let writer = self
            .session
            .lock()
            .connection
            .as_ref()
            .map(|c| c.writer.handle());

        match writer {
            Some(writer) => writer.write_json(text).await,
            None => {
                if self.state.borrow().is_ready() {
                    warn!("Link marked ready without a write channel, downgrading");
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(LinkError::NotConnected)
            }
        }
    }

    pub async fn send_command(&self, command: TargetCommand) -> Result<(), LinkError> {
        debug!("Sending {:?}", command);
        self.write_json(&command.to_json()).await
    }

    /// Send only if the connection attached as `generation` is still the
    /// current one. A replaced or detached connection yields `NotConnected`.
    pub(crate) async fn send_command_on(
        &self,
        generation: u64,
        command: TargetCommand,
    ) -> Result<(), LinkError> {
        let writer = {
            let session = self.session.lock();
            if self.generation() != generation {
                None
            } else {
                session.connection.as_ref().map(|c| c.writer.handle())
            }
        };
        let Some(writer) = writer else {
            debug!("Dropping {:?} for a stale connection", command);
            return Err(LinkError::NotConnected);
        };
        debug!("Sending {:?}", command);
        writer.write_json(&command.to_json()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{notify_uuid, write_uuid, MockTransport};
    use crate::infrastructure::bluetooth::writer::WriteConfig;
    use std::sync::Arc;

    /// A link attached to `transport` and marked ready
    pub(crate) fn ready_link(transport: Arc<MockTransport>) -> Arc<Link> {
        let (events, _) = broadcast::channel(64);
        let link = Arc::new(Link::new(events, 10 * 1024));
        link.attach(ActiveConnection {
            peripheral: Peripheral::new("peripheral-1", "Target-01"),
            write_channel: write_uuid(),
            notify_channel: notify_uuid(),
            writer: WriteScheduler::spawn(transport, write_uuid(), WriteConfig::default()),
        });
        link.set_state(ConnectionState::Ready);
        link
    }

    #[tokio::test]
    async fn test_write_without_channel_downgrades_state() {
        let (events, mut rx) = broadcast::channel(8);
        let link = Link::new(events, 1024);
        link.set_state(ConnectionState::Ready);

        assert_eq!(link.write_json("{}").await, Err(LinkError::NotConnected));
        assert_eq!(link.state(), ConnectionState::Disconnected);

        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::StateChanged(ConnectionState::Ready))
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(LinkEvent::StateChanged(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_detach_clears_buffer_and_connection() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport);
        let generation = link.generation();

        link.ingest(br#"{"type":"version","#);
        assert_eq!(link.detach().map(|p| p.name), Some("Target-01".to_string()));
        assert!(link.generation() > generation);
        assert!(!link.is_connected());
        assert_eq!(link.session.lock().reassembler.buffered_len(), 0);
        assert_eq!(link.write_json("{}").await, Err(LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_detach_forgets_network_devices() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport);
        link.ingest(br#"{"type":"netlink","action":"device_list","content":{"devices":[{"name":"M","mode":"master"}]}}"#);
        assert_eq!(link.dispatcher().network_devices().len(), 1);

        link.detach();
        assert!(link.dispatcher().network_devices().is_empty());
        assert!(link.dispatcher().master_device().is_none());
    }

    #[tokio::test]
    async fn test_command_for_replaced_connection_is_dropped() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        let stale = link.generation();

        link.detach();
        let current = link.attach(ActiveConnection {
            peripheral: Peripheral::new("peripheral-2", "Target-02"),
            write_channel: write_uuid(),
            notify_channel: notify_uuid(),
            writer: WriteScheduler::spawn(transport.clone(), write_uuid(), WriteConfig::default()),
        });

        assert_eq!(
            link.send_command_on(stale, TargetCommand::QueryVersion).await,
            Err(LinkError::NotConnected)
        );
        assert!(transport.writes().is_empty());

        link.send_command_on(current, TargetCommand::QueryVersion)
            .await
            .unwrap();
        assert_eq!(transport.written_text(), "{\"action\":\"query_version\"}\n");
    }

    #[tokio::test]
    async fn test_ingest_dispatches_across_fragments() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport);

        link.ingest(br#"{"type":"netlink","action":"device_list","content":{"devices":[{"name":"M","#);
        assert!(link.dispatcher().network_devices().is_empty());
        link.ingest(b"\"mode\":\"master\"}]}}\n");
        assert_eq!(link.dispatcher().master_device().unwrap().name, "M");
    }
}
