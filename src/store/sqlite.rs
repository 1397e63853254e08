//! SQLite-backed task store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::TaskStore;
use crate::error::{StoreError, TransitionError};
use crate::task::{TaskRecord, TaskState};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL,
    task_name   TEXT NOT NULL DEFAULT '',
    message     TEXT,
    state       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
"#;

/// Task store on a SQLite database.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Opens (creating if missing) the database at `url` and applies the
    /// schema.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite URL (e.g., "sqlite://tasks.db")
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(url = url, "Task store opened");
        Ok(Self { pool })
    }

    /// Counts records in each state.
    pub async fn count_by_state(&self) -> Result<Vec<(TaskState, u64)>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM tasks GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let state: String = row.get("state");
                let n: i64 = row.get("n");
                (TaskState::parse(&state), n.max(0) as u64)
            })
            .collect())
    }

    async fn current_state(&self, id: Uuid) -> Result<Option<TaskState>, StoreError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(state.map(|s| TaskState::parse(&s)))
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let state: String = row.get("state");

    Ok(TaskRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id '{}': {}", id, e)))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::Corrupt(format!("created_at '{}': {}", created_at, e)))?
            .with_timezone(&Utc),
        task_name: row.get("task_name"),
        message: row.get("message"),
        state: TaskState::parse(&state),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, created_at, task_name, message, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(record.id.to_string())
        .bind(record.created_at.to_rfc3339())
        .bind(&record.task_name)
        .bind(&record.message)
        .bind(record.state.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, created_at, task_name, message, state FROM tasks WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_state(&self, id: Uuid, state: TaskState) -> Result<(), StoreError> {
        // Rejects targets that are never reachable before touching the row.
        TaskState::Pending.transition_to(state)?;

        let result = sqlx::query("UPDATE tasks SET state = ?1 WHERE id = ?2 AND state = 'pending'")
            .bind(state.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.current_state(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(from) => Err(TransitionError { from, to: state }.into()),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
