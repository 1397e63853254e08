//! Task lifecycle state.
//!
//! The lifecycle only moves forward: `Pending -> {Complete, Failed}`.
//! `Unknown` is never assigned on purpose; it is what any unrecognized
//! state text decodes to.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TransitionError;

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskState {
    /// Invalid or unrecognized state.
    #[default]
    Unknown,
    /// Stored and enqueued, waiting to be processed.
    Pending,
    /// Processing ran and failed.
    Failed,
    /// Processing ran and succeeded.
    Complete,
}

impl TaskState {
    /// Parses state text case-insensitively. Total: anything that is not a
    /// known state name becomes `Unknown`, including padded names.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pending" => TaskState::Pending,
            "failed" => TaskState::Failed,
            "complete" => TaskState::Complete,
            _ => TaskState::Unknown,
        }
    }

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Unknown => "unknown",
            TaskState::Pending => "pending",
            TaskState::Failed => "failed",
            TaskState::Complete => "complete",
        }
    }

    /// Whether processing has settled the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Complete) | (TaskState::Pending, TaskState::Failed)
        )
    }

    /// Validates a transition and returns the new state.
    pub fn transition_to(self, next: TaskState) -> Result<TaskState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TaskState {
    fn from(value: &str) -> Self {
        TaskState::parse(value)
    }
}

impl Serialize for TaskState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // null decodes like an unrecognized value
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.as_deref().map(TaskState::parse).unwrap_or_default())
    }
}
