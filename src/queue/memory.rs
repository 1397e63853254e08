//! In-process queue.
//!
//! Keeps ready messages in a FIFO and received messages in an in-flight map
//! until they are acknowledged. Unacknowledged messages can be put back with
//! [`MemoryQueue::redeliver_unacknowledged`], standing in for a broker's
//! visibility timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{QueueMessage, Subscription, Topic};
use crate::error::QueueError;

#[derive(Default)]
struct Inner {
    ready: VecDeque<Option<Vec<u8>>>,
    in_flight: HashMap<u64, Option<Vec<u8>>>,
    next_tag: u64,
    acknowledged: u64,
    receive_failures: usize,
    publish_failures: usize,
    closed: bool,
}

/// In-memory queue implementing both [`Topic`] and [`Subscription`].
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a raw delivery, including an absent body, bypassing the
    /// publish path.
    pub fn push_raw(&self, body: Option<Vec<u8>>) {
        self.lock().ready.push_back(body);
        self.available.notify_one();
    }

    /// Makes the next `count` receives fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.lock().receive_failures += count;
        self.available.notify_one();
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().publish_failures += count;
    }

    /// Closes the queue; pending and future receives fail with
    /// `QueueError::Closed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
        self.available.notify_one();
    }

    /// Moves all unacknowledged messages back to the front of the queue,
    /// oldest delivery first.
    pub fn redeliver_unacknowledged(&self) -> usize {
        let mut inner = self.lock();
        let mut tags: Vec<u64> = inner.in_flight.keys().copied().collect();
        tags.sort_unstable();
        let count = tags.len();
        for tag in tags.into_iter().rev() {
            if let Some(body) = inner.in_flight.remove(&tag) {
                inner.ready.push_front(body);
            }
        }
        drop(inner);
        if count > 0 {
            self.available.notify_one();
        }
        count
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages received but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total number of acknowledgments accepted.
    pub fn acknowledged_count(&self) -> u64 {
        self.lock().acknowledged
    }

    /// Bodies waiting to be received, front first.
    pub fn ready_bodies(&self) -> Vec<Option<Vec<u8>>> {
        self.lock().ready.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self) -> Option<Result<QueueMessage, QueueError>> {
        let mut inner = self.lock();
        if inner.closed {
            return Some(Err(QueueError::Closed));
        }
        if inner.receive_failures > 0 {
            inner.receive_failures -= 1;
            return Some(Err(QueueError::ConnectionFailed(
                "injected receive failure".to_string(),
            )));
        }
        let body = inner.ready.pop_front()?;
        inner.next_tag += 1;
        let tag = inner.next_tag;
        inner.in_flight.insert(tag, body.clone());
        Some(Ok(QueueMessage::new(tag, body)))
    }
}

#[async_trait]
impl Topic for MemoryQueue {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.publish_failures > 0 {
                inner.publish_failures -= 1;
                return Err(QueueError::ConnectionFailed(
                    "injected publish failure".to_string(),
                ));
            }
            inner.ready.push_back(Some(body));
        }
        self.available.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Subscription for MemoryQueue {
    async fn receive(&self) -> Result<QueueMessage, QueueError> {
        loop {
            if let Some(result) = self.try_take() {
                return result;
            }
            // notify_one stores a permit when nobody waits, so a publish
            // between try_take and here is not lost.
            self.available.notified().await;
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.in_flight.remove(&message.delivery_tag()).is_some() {
            inner.acknowledged += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_publish_receive() {
        let queue = MemoryQueue::new();
        queue.publish(b"first".to_vec()).await.unwrap();
        queue.publish(b"second".to_vec()).await.unwrap();

        let first = queue.receive().await.unwrap();
        let second = queue.receive().await.unwrap();

        assert_eq!(first.body(), Some(&b"first"[..]));
        assert_eq!(second.body(), Some(&b"second"[..]));
        assert_eq!(queue.in_flight_len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_in_flight() {
        let queue = MemoryQueue::new();
        queue.publish(b"work".to_vec()).await.unwrap();
        let message = queue.receive().await.unwrap();

        queue.acknowledge(&message).await.unwrap();
        queue.acknowledge(&message).await.unwrap();

        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.acknowledged_count(), 1);
        assert_eq!(queue.redeliver_unacknowledged(), 0);
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.publish(b"late".to_vec()).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.body(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_redeliver_preserves_order_ahead_of_ready() {
        let queue = MemoryQueue::new();
        for body in ["a", "b", "c"] {
            queue.publish(body.as_bytes().to_vec()).await.unwrap();
        }
        let _a = queue.receive().await.unwrap();
        let _b = queue.receive().await.unwrap();

        assert_eq!(queue.redeliver_unacknowledged(), 2);
        let order: Vec<Vec<u8>> = queue.ready_bodies().into_iter().flatten().collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let queue = MemoryQueue::new();
        queue.fail_next_receives(1);
        queue.fail_next_publishes(1);

        assert!(queue.receive().await.is_err());
        assert!(queue.publish(b"x".to_vec()).await.is_err());
        queue.publish(b"y".to_vec()).await.unwrap();
        assert!(queue.receive().await.is_ok());
    }

    #[tokio::test]
    async fn test_absent_body_delivery() {
        let queue = MemoryQueue::new();
        queue.push_raw(None);
        let message = queue.receive().await.unwrap();
        assert!(message.body().is_none());
    }

    #[tokio::test]
    async fn test_close_fails_receive() {
        let queue = MemoryQueue::new();
        queue.close();
        assert!(matches!(queue.receive().await, Err(QueueError::Closed)));
        assert!(matches!(
            queue.publish(b"x".to_vec()).await,
            Err(QueueError::Closed)
        ));
    }
}
