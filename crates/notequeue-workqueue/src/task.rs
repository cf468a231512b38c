//! Task definition, status and lock tokens.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Task status.
///
/// `Completed`, `Failed` and `Canceled` are terminal: lock/release/delete
/// bookkeeping never overwrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error. Not retried by the queue.
    Failed,
    /// Deleted before it finished.
    Canceled,
}

impl TaskStatus {
    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Column value used by the SQLite store.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(QueueError::Database(format!("unknown task status '{}'", other))),
        }
    }
}

/// Normalize a caller-supplied priority.
///
/// Non-finite values become 0; finite values are truncated toward zero
/// (`as` saturates at the i64 bounds).
pub fn normalize_priority(priority: f64) -> i64 {
    if priority.is_finite() {
        priority.trunc() as i64
    } else {
        0
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Queue partition this task belongs to.
    pub queue_id: String,
    /// Queue-specific payload.
    pub payload: serde_json::Value,
    /// Higher claims first.
    pub priority: i64,
    /// Creation time.
    pub added: DateTime<Utc>,
    /// Current status.
    pub status: TaskStatus,
    /// Token of the batch claim that owns this task.
    pub lock_id: Option<String>,
    /// When the task was claimed or locked.
    pub started: Option<DateTime<Utc>>,
    /// Soft-delete tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(queue_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue_id: queue_id.into(),
            payload,
            priority: 0,
            added: Utc::now(),
            status: TaskStatus::Pending,
            lock_id: None,
            started: None,
            deleted_at: None,
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set task priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Soft-deleted tasks are never claimed again.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// A non-deleted task carrying a lock token.
    pub fn is_running(&self) -> bool {
        self.lock_id.is_some() && !self.is_deleted()
    }

    /// Eligible for `take_first_n`.
    pub fn is_claimable(&self) -> bool {
        self.status == TaskStatus::Pending && self.lock_id.is_none() && !self.is_deleted()
    }
}

/// Options a producer passes alongside a payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Forced priority. Falls back to a numeric `priority` field on the payload.
    #[serde(default)]
    pub priority: Option<f64>,
}

impl TaskOptions {
    /// Options with a forced priority.
    pub fn with_priority(priority: f64) -> Self {
        Self {
            priority: Some(priority),
        }
    }
}

/// Opaque identifier of one batch claim.
///
/// The empty token means "nothing claimed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// A fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The "nothing claimed" sentinel.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// True for the sentinel.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
