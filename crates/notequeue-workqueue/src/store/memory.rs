//! In-memory task store.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{StatusCounts, TaskRecordStore};
use crate::error::QueueError;
use crate::task::{LockToken, Task, TaskStatus};

struct Entry {
    /// Insertion order, kept across re-adds.
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Entry>,
    next_seq: u64,
}

/// In-memory task store for tests and disposable setups.
///
/// Every operation, including a whole claim, runs under one mutex.
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted<'a>(entries: impl Iterator<Item = &'a Entry>) -> Vec<&'a Entry> {
    let mut entries: Vec<&Entry> = entries.collect();
    entries.sort_by(|a, b| a.task.added.cmp(&b.task.added).then(a.seq.cmp(&b.seq)));
    entries
}

fn claim_rank(a: &Entry, b: &Entry) -> Ordering {
    b.task
        .priority
        .cmp(&a.task.priority)
        .then(a.task.added.cmp(&b.task.added))
        .then(a.seq.cmp(&b.seq))
}

#[async_trait]
impl TaskRecordStore for MemoryTaskStore {
    async fn add(&self, mut task: Task) -> Result<(), QueueError> {
        task.status = TaskStatus::Pending;
        task.deleted_at = None;
        task.lock_id = None;
        task.started = None;

        let mut state = self.state.lock().await;
        let existing = state.tasks.get(&task.id).map(|e| e.seq);
        let seq = match existing {
            Some(seq) => seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        state.tasks.insert(task.id.clone(), Entry { seq, task });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(id).map(|e| e.task.clone()))
    }

    async fn get_all(&self, queue_id: &str) -> Result<Vec<Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(sorted(state.tasks.values().filter(|e| e.task.queue_id == queue_id))
            .into_iter()
            .map(|e| e.task.clone())
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(id) {
            let task = &mut entry.task;
            if !task.status.is_terminal() {
                task.status = TaskStatus::Canceled;
            }
            task.deleted_at = Some(Utc::now());
            task.lock_id = None;
            task.started = None;
        }
        Ok(())
    }

    async fn lock(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(id) {
            let task = &mut entry.task;
            if !task.is_deleted() && !task.status.is_terminal() {
                task.started = Some(Utc::now());
                task.status = TaskStatus::Processing;
            }
        }
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(id) {
            let task = &mut entry.task;
            if task.is_deleted() {
                return Ok(());
            }
            task.started = None;
            task.lock_id = None;
            if !task.status.is_terminal() {
                task.status = TaskStatus::Pending;
            }
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get_mut(id) {
            entry.task.status = status;
        }
        Ok(())
    }

    async fn clear(&self, queue_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.tasks.retain(|_, e| e.task.queue_id != queue_id);
        Ok(())
    }

    async fn take_first_n(&self, n: usize, queue_id: &str) -> Result<LockToken, QueueError> {
        if n == 0 {
            return Ok(LockToken::empty());
        }
        let mut state = self.state.lock().await;

        let mut eligible: Vec<(&String, &Entry)> = state
            .tasks
            .iter()
            .filter(|(_, e)| e.task.queue_id == queue_id && e.task.is_claimable())
            .collect();
        eligible.sort_by(|(_, a), (_, b)| claim_rank(a, b));
        let ids: Vec<String> = eligible.into_iter().take(n).map(|(id, _)| id.clone()).collect();

        if ids.is_empty() {
            return Ok(LockToken::empty());
        }

        let token = LockToken::generate();
        let now = Utc::now();
        for id in ids {
            if let Some(entry) = state.tasks.get_mut(&id) {
                entry.task.lock_id = Some(token.as_str().to_string());
                entry.task.status = TaskStatus::Processing;
                entry.task.started = Some(now);
            }
        }
        Ok(token)
    }

    async fn get_lock(&self, token: &LockToken) -> Result<HashMap<String, Task>, QueueError> {
        if token.is_empty() {
            return Ok(HashMap::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|e| !e.task.is_deleted() && e.task.lock_id.as_deref() == Some(token.as_str()))
            .map(|e| (e.task.id.clone(), e.task.clone()))
            .collect())
    }

    async fn get_lock_ordered(&self, token: &LockToken) -> Result<Vec<Task>, QueueError> {
        if token.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        let mut claimed: Vec<&Entry> = state
            .tasks
            .values()
            .filter(|e| !e.task.is_deleted() && e.task.lock_id.as_deref() == Some(token.as_str()))
            .collect();
        claimed.sort_by(|a, b| claim_rank(a, b));
        Ok(claimed.into_iter().map(|e| e.task.clone()).collect())
    }

    async fn get_running_tasks(
        &self,
        queue_id: &str,
    ) -> Result<HashMap<String, Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|e| e.task.queue_id == queue_id && e.task.is_running())
            .map(|e| (e.task.id.clone(), e.task.clone()))
            .collect())
    }

    async fn counts(&self, queue_id: &str) -> Result<StatusCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for entry in state.tasks.values().filter(|e| e.task.queue_id == queue_id) {
            counts.record(entry.task.status, 1);
            if entry.task.is_deleted() {
                counts.deleted += 1;
            }
            if entry.task.is_running() {
                counts.running += 1;
            }
        }
        Ok(counts)
    }

    async fn queue_ids(&self) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.tasks.values().map(|e| e.task.queue_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
