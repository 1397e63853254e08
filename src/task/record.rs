//! Task records and submission requests.
//!
//! A `TaskRecord` is both the document written to the store and the JSON
//! body placed on the queue, so the two always share an `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskState;
use crate::error::TransitionError;

/// Request to create a task, as accepted by the producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Name of the requested work.
    #[serde(default)]
    pub task_name: String,
    /// Optional free-form payload.
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskRequest {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            message: None,
        }
    }

    /// Sets the message payload.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The durable unit of work.
///
/// Wire format:
///
/// ```text
/// {"id": "<uuid>", "time": "<rfc3339>", "task_name": "demo",
///  "message": "optional", "state": "pending"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// When the task was created.
    #[serde(rename = "time")]
    pub created_at: DateTime<Utc>,
    /// Name of the requested work.
    #[serde(default)]
    pub task_name: String,
    /// Optional free-form payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Lifecycle state. Absent or unrecognized values decode as `Unknown`.
    #[serde(default)]
    pub state: TaskState,
}

impl TaskRecord {
    /// Creates a new pending record with a fresh id and the current time.
    pub fn pending(request: TaskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            task_name: request.task_name,
            message: request.message,
            state: TaskState::Pending,
        }
    }

    /// Moves the record forward in its lifecycle.
    pub fn transition(&mut self, next: TaskState) -> Result<(), TransitionError> {
        self.state = self.state.transition_to(next)?;
        Ok(())
    }

    /// Serializes the record into a queue message body.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a record from a queue message body.
    pub fn from_body(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
