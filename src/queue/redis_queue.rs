//! Redis-backed queue with reliable receive.
//!
//! The queue uses two Redis lists:
//!
//! - `{queue_name}`: main list; producers `LPUSH`, consumers pop from the right
//! - `{queue_name}:processing`: messages received but not yet acknowledged
//!
//! Receiving uses `BRPOPLPUSH` so a message is atomically moved to the
//! processing list. Acknowledging removes it from there. Anything left in the
//! processing list (a crash, a forced exit, a receive abandoned by
//! cancellation) is moved back by [`RedisQueue::recover_unacknowledged`] when
//! the consumer starts, which is how redelivery happens.
//!
//! The queue keeps no per-delivery state: a message is acknowledged by
//! removing one copy of its body from the processing list.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{QueueMessage, Subscription, Topic};
use crate::error::QueueError;

/// Seconds each `BRPOPLPUSH` waits before the receive loop polls again.
const RECEIVE_POLL_SECS: usize = 1;

/// Redis list queue implementing both [`Topic`] and [`Subscription`].
pub struct RedisQueue {
    /// Connection dedicated to blocking pops.
    blocking: ConnectionManager,
    /// Connection for publish, acknowledge and bookkeeping, so these never
    /// wait behind a blocking pop.
    control: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    next_tag: AtomicU64,
}

impl RedisQueue {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let blocking = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let control = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            blocking,
            control,
            queue_name: queue_name.to_string(),
            processing_queue: processing_queue_name(queue_name),
            next_tag: AtomicU64::new(1),
        })
    }

    /// Moves every message left in the processing list back to the front of
    /// the main list.
    ///
    /// # Returns
    ///
    /// The number of messages recovered.
    pub async fn recover_unacknowledged(&self) -> Result<usize, QueueError> {
        let mut conn = self.control.clone();
        let stranded: Vec<Vec<u8>> = conn.lrange(&self.processing_queue, 0, -1).await?;

        let mut recovered = 0;
        for raw in stranded {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &raw)
                .rpush(&self.queue_name, &raw);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.control.clone();
        let pending: usize = conn.llen(&self.queue_name).await?;
        let processing: usize = conn.llen(&self.processing_queue).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_messages: pending,
            processing_messages: processing,
        })
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl Topic for RedisQueue {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.control.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, body).await?;
        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisQueue {
    async fn receive(&self) -> Result<QueueMessage, QueueError> {
        let mut conn = self.blocking.clone();

        loop {
            let popped: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
                .arg(&self.queue_name)
                .arg(&self.processing_queue)
                .arg(RECEIVE_POLL_SECS)
                .query_async(&mut conn)
                .await?;

            if let Some(raw) = popped {
                let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                return Ok(QueueMessage::new(tag, Some(raw)));
            }
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        // Every delivery from this queue carries its body.
        let Some(raw) = message.body() else {
            return Ok(());
        };

        let mut conn = self.control.clone();
        conn.lrem::<_, _, ()>(&self.processing_queue, 1, raw).await?;
        Ok(())
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Messages waiting to be received.
    pub pending_messages: usize,
    /// Messages received but not yet acknowledged.
    pub processing_messages: usize,
}

impl QueueStats {
    /// Returns the total number of messages in both lists.
    pub fn total_messages(&self) -> usize {
        self.pending_messages + self.processing_messages
    }
}

fn processing_queue_name(queue_name: &str) -> String {
    format!("{}:processing", queue_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_queue_name() {
        assert_eq!(processing_queue_name("data-egress"), "data-egress:processing");
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending_messages: 10,
            processing_messages: 5,
        };

        assert_eq!(stats.total_messages(), 15);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisQueue::connect("not a url", "tasks").await;
        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    async fn test_publish_receive_acknowledge() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let name = format!("ingest-test-{}", uuid::Uuid::new_v4());
        let queue = RedisQueue::connect(&url, &name).await.unwrap();

        queue.publish(b"hello".to_vec()).await.unwrap();
        let message = queue.receive().await.unwrap();
        assert_eq!(message.body(), Some(&b"hello"[..]));
        assert_eq!(queue.stats().await.unwrap().processing_messages, 1);

        queue.acknowledge(&message).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total_messages(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis
    async fn test_acknowledge_matches_on_body_not_delivery_tag() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let name = format!("ingest-test-{}", uuid::Uuid::new_v4());
        let queue = RedisQueue::connect(&url, &name).await.unwrap();

        queue.publish(b"first".to_vec()).await.unwrap();
        queue.publish(b"second".to_vec()).await.unwrap();
        let _failed = queue.receive().await.unwrap();
        let received = queue.receive().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().processing_messages, 2);

        // A copy of the delivery with a different tag still acknowledges it.
        let copy = QueueMessage::new(
            received.delivery_tag() + 100,
            Some(received.body().unwrap().to_vec()),
        );
        queue.acknowledge(&copy).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().processing_messages, 1);

        // The unacknowledged one is only held by Redis.
        assert_eq!(queue.recover_unacknowledged().await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis
    async fn test_recover_unacknowledged() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let name = format!("ingest-test-{}", uuid::Uuid::new_v4());
        let queue = RedisQueue::connect(&url, &name).await.unwrap();

        queue.publish(b"stranded".to_vec()).await.unwrap();
        let _never_acked = queue.receive().await.unwrap();

        assert_eq!(queue.recover_unacknowledged().await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending_messages, 1);
        assert_eq!(stats.processing_messages, 0);
    }
}
