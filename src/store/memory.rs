//! In-memory task store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::TaskStore;
use crate::error::StoreError;
use crate::task::{TaskRecord, TaskState};

/// Task store backed by a map. Applies the same rules as the SQLite
/// adapter.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<Uuid, TaskRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create` and `update_state` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed(
                "store writes disabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_state(&self, id: Uuid, state: TaskState) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.transition(state)?;
        Ok(())
    }

    async fn close(&self) {}
}
