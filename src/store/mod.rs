//! Document storage for task records.
//!
//! The producer writes each record here before publishing it, and the
//! processing stage moves it to a terminal state after running the work.
//!
//! # Adapters
//!
//! - [`SqliteTaskStore`]: SQLite database via sqlx
//! - [`MemoryTaskStore`]: in-process map used by tests
//!
//! # Usage
//!
//! ```rust,ignore
//! use ingest_pipeline::store::{open_store, TaskStore};
//!
//! let store = open_store("sqlite://tasks.db").await?;
//! store.create(&record).await?;
//! store.update_state(record.id, TaskState::Complete).await?;
//! ```

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{TaskRecord, TaskState};

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

/// Storage for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new record. Fails with `StoreError::Duplicate` if the id
    /// already exists.
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Looks up a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError>;

    /// Moves a record to `state`. Only `Pending -> Complete` and
    /// `Pending -> Failed` are accepted; anything else fails with a
    /// transition error and leaves the record untouched.
    async fn update_state(&self, id: Uuid, state: TaskState) -> Result<(), StoreError>;

    /// Releases the underlying connections.
    async fn close(&self);
}

/// Opens a store from a `sqlite://` collection URL.
pub async fn open_store(collection_url: &str) -> Result<SqliteTaskStore, StoreError> {
    if !collection_url.starts_with("sqlite:") {
        return Err(StoreError::UnsupportedUrl(collection_url.to_string()));
    }
    SqliteTaskStore::open(collection_url).await
}
