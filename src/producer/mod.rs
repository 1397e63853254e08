//! Ingestion producer.
//!
//! Turns a task request into a pending record, writes it to the store and
//! publishes it to the queue. The store write and the publish are not
//! atomic: if the publish fails the record stays `pending` and is not
//! retried.

pub mod http;

use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ProducerError, StoreError};
use crate::metrics::{MetricsCollector, SubmitOutcome};
use crate::queue::Topic;
use crate::store::TaskStore;
use crate::task::{TaskRecord, TaskRequest};

pub use http::{router, AppState};

/// Accepts task requests and hands them to the store and the queue.
pub struct IngestionProducer {
    store: Arc<dyn TaskStore>,
    topic: Arc<dyn Topic>,
    metrics: MetricsCollector,
}

impl IngestionProducer {
    pub fn new(store: Arc<dyn TaskStore>, topic: Arc<dyn Topic>) -> Self {
        Self {
            store,
            topic,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a pending task for `request` and enqueues it.
    ///
    /// # Errors
    ///
    /// - `ProducerError::Encode` if the record cannot be serialized
    /// - `ProducerError::Store` if the store write fails; nothing was
    ///   published
    /// - `ProducerError::Publish` if the publish fails; the stored record
    ///   stays pending
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskRecord, ProducerError> {
        let record = TaskRecord::pending(request);

        let body = record.to_body().map_err(|e| {
            self.metrics.record_submission(SubmitOutcome::EncodeFailed);
            error!(task_id = %record.id, error = %e, "Could not serialize task");
            ProducerError::Encode(e)
        })?;

        if let Err(e) = self.store.create(&record).await {
            self.metrics.record_submission(SubmitOutcome::StoreFailed);
            error!(task_id = %record.id, error = %e, "Could not save task to document storage");
            return Err(e.into());
        }

        if let Err(source) = self.topic.publish(body).await {
            self.metrics.record_submission(SubmitOutcome::PublishFailed);
            error!(task_id = %record.id, error = %source, "Could not push task to queue");
            return Err(ProducerError::Publish {
                task_id: record.id,
                source,
            });
        }

        self.metrics.record_submission(SubmitOutcome::Accepted);
        info!(task_id = %record.id, task_name = %record.task_name, "Task submitted");
        Ok(record)
    }

    /// Looks up a task by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get(id).await
    }

    /// Closes the underlying store.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, Subscription};
    use crate::store::MemoryTaskStore;
    use crate::task::TaskState;

    fn producer() -> (IngestionProducer, Arc<MemoryTaskStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(MemoryQueue::new());
        (
            IngestionProducer::new(store.clone(), queue.clone()),
            store,
            queue,
        )
    }

    #[tokio::test]
    async fn test_submit_stores_then_publishes_same_record() {
        let (producer, store, queue) = producer();

        let record = producer.submit(TaskRequest::new("demo")).await.unwrap();

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Pending);
        assert_eq!(stored.task_name, "demo");

        let message = queue.receive().await.unwrap();
        let published = TaskRecord::from_body(message.body().unwrap()).unwrap();
        assert_eq!(published.id, record.id);
        assert_eq!(published.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let (producer, store, queue) = producer();
        store.set_fail_writes(true);

        let err = producer.submit(TaskRequest::new("demo")).await.unwrap_err();

        assert!(matches!(err, ProducerError::Store(_)));
        assert!(err.is_dependency_failure());
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_record_pending() {
        let (producer, store, queue) = producer();
        queue.fail_next_publishes(1);

        let err = producer.submit(TaskRequest::new("demo")).await.unwrap_err();

        let task_id = match err {
            ProducerError::Publish { task_id, .. } => task_id,
            other => panic!("expected publish failure, got {other}"),
        };
        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Pending);
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_each_submission_gets_fresh_id() {
        let (producer, store, _queue) = producer();
        let a = producer.submit(TaskRequest::default()).await.unwrap();
        let b = producer.submit(TaskRequest::default()).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(store.len().await, 2);
        assert!(producer.get(a.id).await.unwrap().is_some());
    }
}
