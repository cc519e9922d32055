//! Image Transfer Protocol Engine
//!
//! Sends an (already compressed) image to the master device of the target's
//! network through `netlink_forward` messages:
//!
//! ```text
//! ResolvingMaster ──► AwaitingReadyAck ──► Started ──► SendingChunks ──► Completed
//!        │                   │                │              │
//!        └───────────────────┴────────────────┴──────────────┴──► Failed
//! ```
//!
//! One session at a time. The session runs as its own task; cancelling or
//! failing it from outside aborts that task, which drops every pending timer
//! and the ACK listener with it. All state changes carry the session
//! generation and are ignored once that session is no longer current.

use crate::domain::models::{LinkEvent, NetworkDevice};
use crate::infrastructure::bluetooth::error::TransferError;
use crate::infrastructure::bluetooth::link::Link;
use crate::infrastructure::bluetooth::protocol::{self, TargetCommand};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Raw image bytes per chunk, before base64
    pub chunk_size: usize,
    pub master_poll_interval: Duration,
    pub master_resolve_timeout: Duration,
    pub ready_ack_timeout: Duration,
    pub ready_settle: Duration,
    pub start_settle: Duration,
    pub chunk_pacing: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            master_poll_interval: Duration::from_millis(100),
            master_resolve_timeout: Duration::from_secs(2),
            ready_ack_timeout: Duration::from_secs(10),
            ready_settle: Duration::from_millis(200),
            start_settle: Duration::from_millis(500),
            chunk_pacing: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    ResolvingMaster,
    AwaitingReadyAck,
    Started,
    SendingChunks,
    Completed,
    Failed(TransferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub chunks_sent: usize,
    pub total_chunks: usize,
    pub percent: u8,
}

pub struct ImageTransferJob {
    /// Image bytes as they should arrive on the target
    pub image: Vec<u8>,
    /// Logical name announced in the start message
    pub name: String,
    pub progress: Option<mpsc::UnboundedSender<TransferProgress>>,
}

/// Resolves once the session reaches a terminal state
pub struct TransferHandle {
    generation: u64,
    outcome: oneshot::Receiver<Result<(), TransferError>>,
}

impl TransferHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn wait(self) -> Result<(), TransferError> {
        self.outcome.await.unwrap_or(Err(TransferError::Cancelled))
    }
}

struct ActiveSession {
    generation: u64,
    task: Option<JoinHandle<()>>,
    done: oneshot::Sender<Result<(), TransferError>>,
}

pub struct ImageTransferEngine {
    link: Arc<Link>,
    config: TransferConfig,
    session: Mutex<Option<ActiveSession>>,
    phase: Mutex<TransferPhase>,
    generation: AtomicU64,
}

impl ImageTransferEngine {
    pub fn new(link: Arc<Link>, config: TransferConfig) -> Self {
        Self {
            link,
            config,
            session: Mutex::new(None),
            phase: Mutex::new(TransferPhase::Idle),
            generation: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Start a session. Rejected at once while another session is active.
    pub fn start(self: &Arc<Self>, job: ImageTransferJob) -> Result<TransferHandle, TransferError> {
        if job.image.is_empty() {
            return Err(TransferError::EmptyImage);
        }

        let mut session = self.session.lock();
        if session.is_some() {
            warn!("Rejecting image transfer: another transfer is active");
            return Err(TransferError::AlreadyActive);
        }
        if !self.link.is_connected() {
            return Err(TransferError::NotConnected);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (done, outcome) = oneshot::channel();
        *self.phase.lock() = TransferPhase::ResolvingMaster;
        info!(
            "Starting image transfer #{}: '{}' ({} bytes)",
            generation,
            job.name,
            job.image.len()
        );

        *session = Some(ActiveSession {
            generation,
            task: None,
            done,
        });
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = engine.drive(generation, job).await;
            engine.finish(generation, result);
        });
        if let Some(active) = session.as_mut() {
            active.task = Some(task);
        }

        Ok(TransferHandle {
            generation,
            outcome,
        })
    }

    /// Stop the active session without telling the device.
    pub fn cancel(&self) {
        if self.end_active(Err(TransferError::Cancelled)) {
            info!("Image transfer cancelled");
            *self.phase.lock() = TransferPhase::Idle;
        }
    }

    /// Fail the active session from outside, e.g. on disconnect.
    pub fn fail_active(&self, error: TransferError) {
        if self.end_active(Err(error.clone())) {
            warn!("Image transfer failed: {}", error);
            *self.phase.lock() = TransferPhase::Failed(error);
        }
    }

    fn end_active(&self, result: Result<(), TransferError>) -> bool {
        let Some(active) = self.session.lock().take() else {
            return false;
        };
        if let Some(task) = active.task {
            task.abort();
        }
        let _ = active.done.send(result);
        true
    }

    fn finish(&self, generation: u64, result: Result<(), TransferError>) {
        let mut session = self.session.lock();
        if session.as_ref().map(|s| s.generation) != Some(generation) {
            debug!("Ignoring outcome of superseded transfer #{}", generation);
            return;
        }
        let Some(active) = session.take() else {
            return;
        };
        *self.phase.lock() = match &result {
            Ok(()) => {
                info!("Image transfer #{} complete", generation);
                TransferPhase::Completed
            }
            Err(e) => {
                warn!("Image transfer #{} failed: {}", generation, e);
                TransferPhase::Failed(e.clone())
            }
        };
        let _ = active.done.send(result);
    }

    fn set_phase(&self, generation: u64, phase: TransferPhase) {
        let session = self.session.lock();
        if session.as_ref().map(|s| s.generation) == Some(generation) {
            debug!("Image transfer #{} -> {:?}", generation, phase);
            *self.phase.lock() = phase;
        }
    }

    async fn drive(&self, generation: u64, job: ImageTransferJob) -> Result<(), TransferError> {
        let master = self.resolve_master().await?;
        info!("Forwarding image to master device '{}'", master.name);

        self.set_phase(generation, TransferPhase::AwaitingReadyAck);
        self.await_ready(&master.name).await?;
        sleep(self.config.ready_settle).await;

        self.set_phase(generation, TransferPhase::Started);
        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Vec<&[u8]> = job.image.chunks(chunk_size).collect();
        let total_chunks = chunks.len();
        self.send(
            &master.name,
            protocol::image_start(&job.name, chunk_size, total_chunks, job.image.len()),
        )
        .await?;
        sleep(self.config.start_settle).await;

        self.set_phase(generation, TransferPhase::SendingChunks);
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.send(&master.name, protocol::image_chunk(index, BASE64.encode(chunk)))
                .await?;

            let chunks_sent = index + 1;
            let progress = TransferProgress {
                chunks_sent,
                total_chunks,
                percent: (chunks_sent * 100 / total_chunks) as u8,
            };
            if let Some(tx) = &job.progress {
                let _ = tx.send(progress);
            }
            self.link.publish(LinkEvent::TransferProgress {
                percent: progress.percent,
            });
            sleep(self.config.chunk_pacing).await;
        }

        self.send(&master.name, protocol::image_end()).await
    }

    async fn resolve_master(&self) -> Result<NetworkDevice, TransferError> {
        let dispatcher = self.link.dispatcher();
        if let Some(master) = dispatcher.master_device() {
            return Ok(master);
        }

        info!("No master device known, querying device list");
        self.link.send_command(TargetCommand::QueryDeviceList).await?;

        let deadline = Instant::now() + self.config.master_resolve_timeout;
        loop {
            sleep(self.config.master_poll_interval).await;
            if let Some(master) = dispatcher.master_device() {
                return Ok(master);
            }
            if Instant::now() >= deadline {
                return Err(TransferError::NoMasterDevice);
            }
        }
    }

    async fn await_ready(&self, master: &str) -> Result<(), TransferError> {
        // Listen before asking so a fast reply is not missed
        let mut acks = self.link.dispatcher().register_forward_listener();
        self.send(master, protocol::image_ready()).await?;

        let acked = timeout(self.config.ready_ack_timeout, async {
            while let Some(message) = acks.recv().await {
                if protocol::is_image_ready_ack(&message.frame) {
                    return true;
                }
            }
            false
        })
        .await;

        match acked {
            Ok(true) => {
                debug!("Master '{}' acknowledged ready request", master);
                Ok(())
            }
            _ => Err(TransferError::TargetNotReady),
        }
    }

    async fn send(&self, dest: &str, content: Map<String, Value>) -> Result<(), TransferError> {
        self.link
            .write_json(&protocol::netlink_forward(dest, content))
            .await
            .map_err(TransferError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::link::tests::ready_link;
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use serde_json::json;

    const MASTER_LIST: &str = r#"{"type":"netlink","action":"device_list","content":{"devices":[{"name":"Lane-1","mode":"slave"},{"name":"Hub","mode":"master"}]}}"#;
    const READY_ACK: &str = r#"{"type":"netlink","action":"forward","content":{"ack":"image_ready"}}"#;

    fn engine(link: Arc<Link>) -> Arc<ImageTransferEngine> {
        Arc::new(ImageTransferEngine::new(link, TransferConfig::default()))
    }

    fn job(len: usize) -> ImageTransferJob {
        ImageTransferJob {
            image: (0..len).map(|i| i as u8).collect(),
            name: "target.jpg".into(),
            progress: None,
        }
    }

    fn commands(transport: &MockTransport) -> Vec<String> {
        transport
            .written_messages()
            .iter()
            .map(|m| {
                m.pointer("/content/command")
                    .or_else(|| m.get("action"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_transfer_sequence() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = engine(link.clone());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let handle = engine
            .start(ImageTransferJob {
                progress: Some(progress_tx),
                ..job(300)
            })
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.phase(), TransferPhase::AwaitingReadyAck);
        link.dispatcher().dispatch(READY_ACK);

        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(engine.phase(), TransferPhase::Completed);
        assert!(!engine.is_active());

        assert_eq!(
            commands(&transport),
            vec!["image_ready", "image_start", "image_chunk", "image_chunk", "image_chunk", "image_end"]
        );
        let messages = transport.written_messages();
        assert!(messages.iter().all(|m| m["dest"] == "Hub"));
        assert_eq!(
            messages[1]["content"],
            json!({"chunk_size": 128, "command": "image_start", "name": "target.jpg", "total_chunks": 3, "total_size": 300})
        );
        let decoded: Vec<u8> = messages[2..5]
            .iter()
            .flat_map(|m| BASE64.decode(m["content"]["data"].as_str().unwrap()).unwrap())
            .collect();
        assert_eq!(decoded, job(300).image);

        let mut percents = Vec::new();
        while let Ok(p) = progress_rx.try_recv() {
            percents.push(p.percent);
        }
        assert_eq!(percents, vec![33, 66, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_master_fails_after_query_and_poll_window() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(r#"{"type":"netlink","action":"device_list","content":{"devices":[{"name":"A","mode":"slave"},{"name":"B","mode":"slave"},{"name":"C","mode":""}]}}"#);
        let engine = engine(link);

        let started = Instant::now();
        let result = engine.start(job(10)).unwrap().wait().await;

        assert_eq!(result, Err(TransferError::NoMasterDevice));
        assert_eq!(result.unwrap_err().to_string(), "no master device available");
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(commands(&transport), vec!["netlink_query_device_list"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_arriving_during_poll_is_used() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        let engine = engine(link.clone());

        let _handle = engine.start(job(10)).unwrap();
        sleep(Duration::from_millis(450)).await;
        link.dispatcher().dispatch(MASTER_LIST);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.phase(), TransferPhase::AwaitingReadyAck);
        assert_eq!(
            commands(&transport),
            vec!["netlink_query_device_list", "image_ready"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_just_before_guard_proceeds() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = engine(link.clone());

        let handle = engine.start(job(10)).unwrap();
        sleep(Duration::from_millis(9_900)).await;
        link.dispatcher().dispatch(r#"{"type":"netlink","action":"forward","ack":"image_ready"}"#);
        sleep(Duration::from_millis(250)).await;

        assert_eq!(engine.phase(), TransferPhase::Started);
        assert_eq!(handle.wait().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_has_no_effect() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = engine(link.clone());

        let handle = engine.start(job(10)).unwrap();
        sleep(Duration::from_millis(10_100)).await;

        assert_eq!(
            engine.phase(),
            TransferPhase::Failed(TransferError::TargetNotReady)
        );
        assert_eq!(link.dispatcher().forward_listener_count(), 0);

        link.dispatcher().dispatch(READY_ACK);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(handle.wait().await, Err(TransferError::TargetNotReady));
        assert_eq!(
            engine.phase(),
            TransferPhase::Failed(TransferError::TargetNotReady)
        );
        assert_eq!(commands(&transport), vec!["image_ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected_while_active() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport);
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = engine(link);

        let _first = engine.start(job(10)).unwrap();
        assert!(matches!(
            engine.start(job(10)),
            Err(TransferError::AlreadyActive)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_write_failure_fails_session() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = Arc::new(ImageTransferEngine::new(
            link.clone(),
            TransferConfig {
                chunk_size: 8,
                ..TransferConfig::default()
            },
        ));

        let handle = engine.start(job(40)).unwrap();
        sleep(Duration::from_millis(10)).await;
        link.dispatcher().dispatch(READY_ACK);
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(engine.phase(), TransferPhase::SendingChunks);

        transport.reject_writes();
        let result = handle.wait().await;

        assert!(matches!(result, Err(TransferError::WriteFailed(_))));
        assert!(matches!(engine.phase(), TransferPhase::Failed(TransferError::WriteFailed(_))));
        assert!(!commands(&transport).contains(&"image_end".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resets_without_notifying_device() {
        let (transport, _events) = MockTransport::new();
        let link = ready_link(transport.clone());
        link.dispatcher().dispatch(MASTER_LIST);
        let engine = engine(link.clone());

        let handle = engine.start(job(10)).unwrap();
        sleep(Duration::from_millis(50)).await;
        engine.cancel();

        assert_eq!(handle.wait().await, Err(TransferError::Cancelled));
        assert_eq!(engine.phase(), TransferPhase::Idle);
        assert_eq!(link.dispatcher().forward_listener_count(), 0);

        sleep(Duration::from_secs(15)).await;
        assert_eq!(commands(&transport), vec!["image_ready"]);
        assert!(engine.start(job(10)).is_ok());
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let (events, _) = tokio::sync::broadcast::channel(8);
        let link = Arc::new(Link::new(events, 1024));
        let engine = engine(link);
        assert!(matches!(
            engine.start(job(10)),
            Err(TransferError::NotConnected)
        ));
        assert!(matches!(
            engine.start(job(0)),
            Err(TransferError::EmptyImage)
        ));
    }
}
