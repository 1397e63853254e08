//! Queue transport abstraction.
//!
//! The pipeline talks to the broker through two traits:
//!
//! - [`Topic`]: the producing side, used by the ingestion producer
//! - [`Subscription`]: the consuming side, used by the receiving and
//!   processing stages
//!
//! Delivery is at-least-once. A received message that is never
//! acknowledged is redelivered by the transport (for Redis, when the
//! consumer restarts and recovers its processing list).
//!
//! # Adapters
//!
//! - [`RedisQueue`]: Redis lists with a processing list for in-flight messages
//! - [`MemoryQueue`]: in-process queue used by tests

pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::QueueError;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

/// A message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    loggable_id: String,
    delivery_tag: u64,
    body: Option<Vec<u8>>,
}

impl QueueMessage {
    /// Creates a message for a delivery. The loggable id is derived from the
    /// body so redeliveries of the same payload log the same id.
    pub fn new(delivery_tag: u64, body: Option<Vec<u8>>) -> Self {
        let loggable_id = match body.as_deref() {
            Some(bytes) if !bytes.is_empty() => {
                let digest = Sha256::digest(bytes);
                hex::encode(&digest[..8])
            }
            _ => format!("delivery-{}", delivery_tag),
        };

        Self {
            loggable_id,
            delivery_tag,
            body,
        }
    }

    /// Short identifier suitable for log lines.
    pub fn loggable_id(&self) -> &str {
        &self.loggable_id
    }

    /// Transport-assigned tag used to acknowledge this delivery.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// Producing side of a queue.
#[async_trait]
pub trait Topic: Send + Sync {
    /// Publishes one message body.
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError>;
}

/// Consuming side of a queue.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next message. Only one receive is in flight at a time;
    /// dropping the future abandons the wait.
    async fn receive(&self) -> Result<QueueMessage, QueueError>;

    /// Acknowledges a message so the transport will not redeliver it.
    /// Acknowledging an unknown or already acknowledged delivery is a no-op.
    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Opens a Redis-backed queue from a `redis://` or `rediss://` URL.
pub async fn open_queue(queue_url: &str, queue_name: &str) -> Result<RedisQueue, QueueError> {
    if !(queue_url.starts_with("redis://") || queue_url.starts_with("rediss://")) {
        return Err(QueueError::UnsupportedUrl(queue_url.to_string()));
    }
    RedisQueue::connect(queue_url, queue_name).await
}
