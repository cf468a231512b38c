//! SQLite-backed task store.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::debug;

use super::schema::{format_ts, init_schema, row_to_task, TASK_COLUMNS};
use super::{StatusCounts, TaskRecordStore};
use crate::config::StoreConfig;
use crate::error::QueueError;
use crate::task::{LockToken, Task, TaskStatus};

const TERMINAL: &str = "('completed', 'failed', 'canceled')";

/// Task store on top of an SQLite database.
///
/// Claims run inside `BEGIN IMMEDIATE` transactions, which take the database
/// write lock before selecting. Claimers sharing the file from other
/// connections or processes are serialized by SQLite itself.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await?;
        let busy = Duration::from_millis(StoreConfig::default().busy_timeout_ms);
        conn.call(move |conn| {
            conn.busy_timeout(busy)?;
            init_schema(conn)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Database(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(&path).await?;
        conn.call(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            init_schema(conn)?;
            Ok(())
        })
        .await?;

        debug!("SqliteTaskStore opened at {:?}", path);
        Ok(Self { conn })
    }

    /// Open the store described by `config`.
    pub async fn from_config(config: &StoreConfig) -> Result<Self, QueueError> {
        match &config.db_path {
            Some(path) => Self::open(path, Duration::from_millis(config.busy_timeout_ms)).await,
            None => Self::in_memory().await,
        }
    }

    async fn query_tasks(
        &self,
        sql: String,
        arg: String,
    ) -> Result<Vec<Task>, QueueError> {
        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let tasks = stmt
                    .query_map([&arg], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRecordStore for SqliteTaskStore {
    async fn add(&self, task: Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&task.payload)?;
        let added = format_ts(&task.added);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, queue_id, priority, added, started, status, lock_id, deleted_at, payload)
                     VALUES (?1, ?2, ?3, ?4, NULL, 'pending', NULL, NULL, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        queue_id = excluded.queue_id,
                        priority = excluded.priority,
                        added = excluded.added,
                        started = NULL,
                        status = 'pending',
                        lock_id = NULL,
                        deleted_at = NULL,
                        payload = excluded.payload",
                    params![task.id, task.queue_id, task.priority, added, payload],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                        [&id],
                        row_to_task,
                    )
                    .optional()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    async fn get_all(&self, queue_id: &str) -> Result<Vec<Task>, QueueError> {
        self.query_tasks(
            format!(
                "SELECT {} FROM tasks WHERE queue_id = ?1 ORDER BY added ASC, rowid ASC",
                TASK_COLUMNS
            ),
            queue_id.to_string(),
        )
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        let now = format_ts(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET
                            status = CASE WHEN status IN {} THEN status ELSE 'canceled' END,
                            deleted_at = ?1, lock_id = NULL, started = NULL
                         WHERE id = ?2",
                        TERMINAL
                    ),
                    params![now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn lock(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        let now = format_ts(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET started = ?1, status = 'processing'
                         WHERE id = ?2 AND deleted_at IS NULL AND status NOT IN {}",
                        TERMINAL
                    ),
                    params![now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET started = NULL, lock_id = NULL,
                            status = CASE WHEN status IN {} THEN status ELSE 'pending' END
                         WHERE id = ?1 AND deleted_at IS NULL",
                        TERMINAL
                    ),
                    [&id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), QueueError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear(&self, queue_id: &str) -> Result<(), QueueError> {
        let queue_id = queue_id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM tasks WHERE queue_id = ?1", [&queue_id])?))
            .await?;
        debug!(removed, "Cleared queue rows");
        Ok(())
    }

    async fn take_first_n(&self, n: usize, queue_id: &str) -> Result<LockToken, QueueError> {
        if n == 0 {
            return Ok(LockToken::empty());
        }
        let queue_id = queue_id.to_string();
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let now = format_ts(&Utc::now());

        let token = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM tasks
                         WHERE queue_id = ?1 AND status = 'pending'
                           AND lock_id IS NULL AND deleted_at IS NULL
                         ORDER BY priority DESC, added ASC, rowid ASC
                         LIMIT ?2",
                    )?;
                    let ids = stmt
                        .query_map(params![queue_id, limit], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };

                if ids.is_empty() {
                    return Ok(LockToken::empty());
                }

                let token = LockToken::generate();
                for id in &ids {
                    tx.execute(
                        "UPDATE tasks SET lock_id = ?1, status = 'processing', started = ?2
                         WHERE id = ?3 AND status = 'pending'
                           AND lock_id IS NULL AND deleted_at IS NULL",
                        params![token.as_str(), now, id],
                    )?;
                }
                tx.commit()?;
                Ok(token)
            })
            .await?;

        if !token.is_empty() {
            debug!(lock_id = %token, "Claimed tasks");
        }
        Ok(token)
    }

    async fn get_lock(&self, token: &LockToken) -> Result<HashMap<String, Task>, QueueError> {
        if token.is_empty() {
            return Ok(HashMap::new());
        }
        let tasks = self
            .query_tasks(
                format!(
                    "SELECT {} FROM tasks WHERE lock_id = ?1 AND deleted_at IS NULL",
                    TASK_COLUMNS
                ),
                token.as_str().to_string(),
            )
            .await?;
        Ok(tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
    }

    async fn get_lock_ordered(&self, token: &LockToken) -> Result<Vec<Task>, QueueError> {
        if token.is_empty() {
            return Ok(Vec::new());
        }
        self.query_tasks(
            format!(
                "SELECT {} FROM tasks WHERE lock_id = ?1 AND deleted_at IS NULL
                 ORDER BY priority DESC, added ASC, rowid ASC",
                TASK_COLUMNS
            ),
            token.as_str().to_string(),
        )
        .await
    }

    async fn get_running_tasks(
        &self,
        queue_id: &str,
    ) -> Result<HashMap<String, Task>, QueueError> {
        let tasks = self
            .query_tasks(
                format!(
                    "SELECT {} FROM tasks
                     WHERE queue_id = ?1 AND lock_id IS NOT NULL AND deleted_at IS NULL",
                    TASK_COLUMNS
                ),
                queue_id.to_string(),
            )
            .await?;
        Ok(tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
    }

    async fn counts(&self, queue_id: &str) -> Result<StatusCounts, QueueError> {
        let queue_id = queue_id.to_string();
        let rows: Vec<(String, i64, i64, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status,
                            COUNT(*),
                            SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END),
                            SUM(CASE WHEN deleted_at IS NULL AND lock_id IS NOT NULL THEN 1 ELSE 0 END)
                     FROM tasks WHERE queue_id = ?1 GROUP BY status",
                )?;
                let rows = stmt
                    .query_map([&queue_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts = StatusCounts::default();
        for (status, total, deleted, running) in rows {
            counts.record(status.parse()?, total.max(0) as u64);
            counts.deleted += deleted.max(0) as u64;
            counts.running += running.max(0) as u64;
        }
        Ok(counts)
    }

    async fn queue_ids(&self) -> Result<Vec<String>, QueueError> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT queue_id FROM tasks ORDER BY queue_id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }
}
