use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),
    #[error("broker channel closed")]
    Closed,
    #[error("declare of queue '{queue}' failed: {reason}")]
    Declare { queue: String, reason: String },
    #[error("publish to queue '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("broker transport error: {0}")]
    Transport(String),
}

/// Named queues with buffered delivery.
///
/// `declare_queue` is idempotent and is what a consuming side calls.
/// A side that only ever publishes to a queue calls `declare_outbound`
/// instead, which never makes it a receiver of that queue.
///
/// `MemoryBroker` queues are point-to-point: with several consumers each
/// message goes to exactly one of them. `MeshBroker` delivers a message to
/// every peer that declared the queue for consuming, so each queue name must
/// have exactly one consuming peer.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Prepare `queue` for publishing only.
    async fn declare_outbound(&self, queue: &str) -> Result<(), BrokerError> {
        self.declare_queue(queue).await
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;
    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;
}

/// Receiving side of a queue. Clones compete for the same messages.
#[derive(Clone)]
pub struct Consumer {
    queue: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Consumer {
    pub(crate) fn new(queue: String, rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>) -> Self {
        Self { queue, rx }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next message. `None` means the channel is gone for good.
    pub async fn next(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }
}

/// Declare `queue` for consuming, retrying with a fixed backoff until the
/// broker accepts it.
pub async fn declare_with_retry(broker: &dyn Broker, queue: &str, backoff: Duration) {
    retry_declare(broker, queue, backoff, false).await
}

/// Like [`declare_with_retry`] but through [`Broker::declare_outbound`].
pub async fn declare_outbound_with_retry(broker: &dyn Broker, queue: &str, backoff: Duration) {
    retry_declare(broker, queue, backoff, true).await
}

async fn retry_declare(broker: &dyn Broker, queue: &str, backoff: Duration, outbound: bool) {
    loop {
        let res = if outbound {
            broker.declare_outbound(queue).await
        } else {
            broker.declare_queue(queue).await
        };
        match res {
            Ok(()) => {
                info!(queue=%queue, outbound, "queue declared");
                return;
            }
            Err(e) => {
                warn!(queue=%queue, error=%e, retry_in=?backoff, "queue declare failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// In-process broker. Messages published before anyone consumes stay buffered.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all declared queues, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().await;
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            MemoryQueue {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let queues = self.queues.lock().await;
        let q = queues
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        q.tx.send(body).map_err(|_| BrokerError::Closed)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let queues = self.queues.lock().await;
        let q = queues
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        Ok(Consumer::new(queue.to_string(), q.rx.clone()))
    }
}
