//! Recovery of tasks whose lock outlived its worker.
//!
//! A process that dies mid-batch leaves its tasks `processing` with a lock
//! nobody will release. A task is stale once it has been running longer
//! than the policy allows; recovering it releases it back to `pending`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::store::TaskRecordStore;
use crate::task::Task;

/// When a running task counts as abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleTaskPolicy {
    /// How long a task may stay running.
    pub stale_after: Duration,
}

impl StaleTaskPolicy {
    /// Create a policy.
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    /// Policy configured for a queue, if recovery is enabled.
    pub fn from_config(config: &QueueConfig) -> Option<Self> {
        config.stale_after().map(Self::new)
    }

    /// Check if `task` is stale at `now`.
    pub fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if !task.is_running() {
            return false;
        }
        let Some(started) = task.started else {
            return false;
        };
        match chrono::Duration::from_std(self.stale_after) {
            Ok(limit) => started + limit <= now,
            Err(_) => false,
        }
    }
}

/// Running tasks of `queue_id` that are stale at `now`.
pub async fn find_stale(
    store: &dyn TaskRecordStore,
    queue_id: &str,
    policy: &StaleTaskPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, QueueError> {
    let mut stale: Vec<Task> = store
        .get_running_tasks(queue_id)
        .await?
        .into_values()
        .filter(|task| policy.is_stale(task, now))
        .collect();
    stale.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
    Ok(stale)
}

/// Release every stale task of `queue_id`. Returns the released ids.
pub async fn recover_stale(
    store: &dyn TaskRecordStore,
    queue_id: &str,
    policy: &StaleTaskPolicy,
) -> Result<Vec<String>, QueueError> {
    let stale = find_stale(store, queue_id, policy, Utc::now()).await?;
    let mut recovered = Vec::with_capacity(stale.len());
    for task in stale {
        warn!(
            "Releasing stale task {} on {} (lock {:?}, started {:?})",
            task.id, queue_id, task.lock_id, task.started
        );
        store.release(&task.id).await?;
        recovered.push(task.id);
    }
    if !recovered.is_empty() {
        info!("Recovered {} stale task(s) on {}", recovered.len(), queue_id);
    }
    Ok(recovered)
}
