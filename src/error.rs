//! Error types for ingest-pipeline operations.
//!
//! Defines error types for each subsystem:
//! - Queue transport (publish, receive, acknowledge)
//! - Document store (create, query, state updates)
//! - Task lifecycle transitions
//! - Consumer pipeline stages and per-message processing
//! - Producer dual write
//! - Startup configuration

use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskState;

/// Errors raised by a queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unsupported queue URL '{0}': expected redis:// or rediss://")]
    UnsupportedUrl(String),

    #[error("Queue has been shut down")]
    Closed,
}

/// Errors raised by a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Unsupported collection URL '{0}': expected sqlite://")]
    UnsupportedUrl(String),

    #[error("Task {0} already exists")]
    Duplicate(Uuid),

    #[error("Task {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Stored task is corrupt: {0}")]
    Corrupt(String),
}

/// A task state change that would move the lifecycle backwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid state transition from '{from}' to '{to}'")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// Pipeline-fatal errors. These terminate a stage loop and become the
/// process exit condition.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Backpressure channel closed unexpectedly")]
    ChannelClosed,

    #[error("Stage '{stage}' panicked: {reason}")]
    StagePanicked { stage: String, reason: String },

    #[error("A problem occurred in the {stage} loop: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<PipelineError>,
    },
}

/// Per-message processing errors. Logged and discarded by the processing
/// loop; the message stays unacknowledged.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Message body was absent")]
    MissingBody,

    #[error("Message body was length zero")]
    EmptyBody,

    #[error("Could not parse JSON from message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Task handler failed: {0}")]
    Handler(String),

    #[error("Could not record task state: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned to a caller submitting a task.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Could not serialize task: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Could not save task to document storage: {0}")]
    Store(#[from] StoreError),

    /// The record was stored as pending but never reached the queue.
    #[error("Could not push task {task_id} to queue: {source}")]
    Publish {
        task_id: Uuid,
        #[source]
        source: QueueError,
    },
}

impl ProducerError {
    /// Whether the failure came from an external dependency rather than
    /// from this process.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, ProducerError::Store(_) | ProducerError::Publish { .. })
    }
}

/// Errors in startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration value: {0}")]
    MissingValue(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            from: TaskState::Complete,
            to: TaskState::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from 'complete' to 'pending'"
        );
    }

    #[test]
    fn test_producer_error_dependency_classification() {
        let id = Uuid::new_v4();
        assert!(ProducerError::Store(StoreError::Duplicate(id)).is_dependency_failure());
        assert!(ProducerError::Publish {
            task_id: id,
            source: QueueError::Closed,
        }
        .is_dependency_failure());

        let encode = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!ProducerError::Encode(encode).is_dependency_failure());
    }

    #[test]
    fn test_stage_error_wraps_source() {
        let err = PipelineError::Stage {
            stage: "receiving",
            source: Box::new(PipelineError::ChannelClosed),
        };
        let text = err.to_string();
        assert!(text.contains("receiving"));
        assert!(text.contains("channel closed"));
    }

    #[test]
    fn test_process_error_display() {
        assert!(ProcessError::EmptyBody.to_string().contains("length zero"));
        assert!(ProcessError::MissingBody.to_string().contains("absent"));
        let err = ProcessError::Store(StoreError::NotFound(Uuid::nil()));
        assert!(err.to_string().contains("not found"));
    }
}
