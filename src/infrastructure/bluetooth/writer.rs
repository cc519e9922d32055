//! Write Scheduler
//!
//! Serializes outbound payloads onto the write characteristic. One worker
//! task per connection drains a FIFO queue, so a write is never issued
//! while another is outstanding. Payloads longer than the chunk size go out
//! as consecutive chunks with a fixed pause between them.
//!
//! Delivery is not transactional: when a chunk fails the remaining chunks
//! are abandoned and the caller gets the error, but chunks already written
//! stay written.

use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct WriteConfig {
    /// Largest payload written in one operation
    pub chunk_size: usize,
    /// Pause between consecutive chunks of one payload
    pub chunk_delay: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
        }
    }
}

struct WriteRequest {
    payload: Vec<u8>,
    done: oneshot::Sender<Result<(), LinkError>>,
}

/// Cheap handle for queueing writes
#[derive(Clone)]
pub struct WriteHandle {
    queue: mpsc::UnboundedSender<WriteRequest>,
}

impl WriteHandle {
    /// Send one JSON message, newline-terminated.
    pub async fn write_json(&self, text: &str) -> Result<(), LinkError> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(b'\n');
        self.write_bytes(payload).await
    }

    pub async fn write_bytes(&self, payload: Vec<u8>) -> Result<(), LinkError> {
        let (done, result) = oneshot::channel();
        self.queue
            .send(WriteRequest { payload, done })
            .map_err(|_| LinkError::WriteQueueCleared)?;
        result.await.map_err(|_| LinkError::WriteQueueCleared)?
    }
}

pub struct WriteScheduler {
    handle: WriteHandle,
    worker: JoinHandle<()>,
}

impl WriteScheduler {
    pub fn spawn(transport: Arc<dyn BleTransport>, channel: Uuid, config: WriteConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_queue(transport, channel, config, rx));
        Self {
            handle: WriteHandle { queue: tx },
            worker,
        }
    }

    pub fn handle(&self) -> WriteHandle {
        self.handle.clone()
    }

    /// Stop the worker. Queued and in-flight callers get `WriteQueueCleared`.
    pub fn shutdown(self) {
        self.worker.abort();
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_queue(
    transport: Arc<dyn BleTransport>,
    channel: Uuid,
    config: WriteConfig,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(request) = queue.recv().await {
        let result = send_payload(transport.as_ref(), channel, config, &request.payload).await;
        // The caller may have given up waiting
        let _ = request.done.send(result);
    }
}

async fn send_payload(
    transport: &dyn BleTransport,
    channel: Uuid,
    config: WriteConfig,
    payload: &[u8],
) -> Result<(), LinkError> {
    let chunk_size = config.chunk_size.max(1);
    if payload.len() <= chunk_size {
        trace!("Writing {} bytes", payload.len());
        return Ok(transport.write(channel, payload).await?);
    }

    let total = payload.len().div_ceil(chunk_size);
    debug!("Writing {} bytes in {} chunks", payload.len(), total);
    for (index, chunk) in payload.chunks(chunk_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(config.chunk_delay).await;
        }
        if let Err(e) = transport.write(channel, chunk).await {
            warn!("Chunk {}/{} failed: {}; dropping the rest", index + 1, total, e);
            return Err(e.into());
        }
    }
    Ok(())
}
