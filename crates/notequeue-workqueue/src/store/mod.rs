//! Durable task record store and claim engine.
//!
//! A [`TaskRecordStore`] is the single source of truth for tasks. All
//! ordering and claiming is scoped to one `queue_id`. Operations on ids that
//! do not exist are silent no-ops.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueueError;
use crate::task::{LockToken, Task, TaskStatus};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Per-status tallies for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Rows carrying a tombstone, whatever their status.
    pub deleted: u64,
    /// Non-deleted rows carrying a lock token.
    pub running: u64,
}

impl StatusCounts {
    /// Total rows counted.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.canceled
    }

    pub(crate) fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Canceled => self.canceled += count,
        }
    }
}

/// Persistence contract for tasks.
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    /// Upsert a task by id. Forces `pending`, clears the tombstone and lock
    /// bookkeeping.
    async fn add(&self, task: Task) -> Result<(), QueueError>;

    /// Load a task by id.
    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError>;

    /// All tasks of a queue, oldest first.
    async fn get_all(&self, queue_id: &str) -> Result<Vec<Task>, QueueError>;

    /// Soft-delete: terminal statuses are kept, anything else becomes
    /// `canceled`. Always stamps `deleted_at` and clears the lock.
    async fn delete(&self, id: &str) -> Result<(), QueueError>;

    /// Mark a single task as processing without a batch token.
    async fn lock(&self, id: &str) -> Result<(), QueueError>;

    /// Clear lock bookkeeping. Non-terminal tasks return to `pending`.
    async fn release(&self, id: &str) -> Result<(), QueueError>;

    /// Direct status write, used to record outcomes.
    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), QueueError>;

    /// Hard-delete every row of a queue.
    async fn clear(&self, queue_id: &str) -> Result<(), QueueError>;

    /// Atomically claim up to `n` pending tasks, highest priority first.
    ///
    /// Returns the empty token when nothing qualified.
    async fn take_first_n(&self, n: usize, queue_id: &str) -> Result<LockToken, QueueError>;

    /// Every task carrying `token`.
    async fn get_lock(&self, token: &LockToken) -> Result<HashMap<String, Task>, QueueError>;

    /// Every task carrying `token`, in the order `take_first_n` selected them:
    /// priority descending, then `added`, then insertion order.
    async fn get_lock_ordered(&self, token: &LockToken) -> Result<Vec<Task>, QueueError>;

    /// Non-deleted tasks of a queue that carry any lock token.
    async fn get_running_tasks(&self, queue_id: &str)
        -> Result<HashMap<String, Task>, QueueError>;

    /// Per-status tallies for a queue.
    async fn counts(&self, queue_id: &str) -> Result<StatusCounts, QueueError>;

    /// Distinct queue ids present in the store.
    async fn queue_ids(&self) -> Result<Vec<String>, QueueError>;

    /// Release every task claimed under `token`, one by one.
    async fn release_lock(&self, token: &LockToken) -> Result<(), QueueError> {
        if token.is_empty() {
            return Ok(());
        }
        let tasks = self.get_lock(token).await?;
        debug!(lock_id = %token, count = tasks.len(), "Releasing lock");
        for id in tasks.keys() {
            self.release(id).await?;
        }
        Ok(())
    }
}
