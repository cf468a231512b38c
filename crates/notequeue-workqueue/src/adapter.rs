//! Narrow adapter between a worker pool and the task record store.
//!
//! The pool never sees the table schema: it pushes payloads, claims lock
//! tokens and gets payloads back. A task's id never lives inside its stored
//! payload; it is stripped on the way in and re-injected on the way out for
//! object payloads.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::QueueError;
use crate::store::TaskRecordStore;
use crate::task::{normalize_priority, LockToken, Task, TaskStatus};

/// Key carrying a task id inside object payloads.
pub const ID_KEY: &str = "id";

/// Key a producer may use to carry a priority inside an object payload.
pub const PRIORITY_KEY: &str = "priority";

/// Remove an embedded `id` from an object payload.
pub fn strip_id(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.remove(ID_KEY);
    }
    payload
}

/// Put the task id back into an object payload. Other payloads pass through.
pub fn inject_id(mut payload: Value, id: &str) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert(ID_KEY.to_string(), Value::String(id.to_string()));
    }
    payload
}

/// Numeric `priority` field of an object payload, if any.
pub fn payload_priority(payload: &Value) -> Option<f64> {
    payload.get(PRIORITY_KEY).and_then(Value::as_f64)
}

/// Store adapter bound to one queue.
pub struct StoreAdapter {
    store: Arc<dyn TaskRecordStore>,
    queue_id: String,
}

impl StoreAdapter {
    /// Create an adapter for `queue_id`.
    pub fn new(store: Arc<dyn TaskRecordStore>, queue_id: impl Into<String>) -> Self {
        Self {
            store,
            queue_id: queue_id.into(),
        }
    }

    /// Queue this adapter is bound to.
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn TaskRecordStore> {
        &self.store
    }

    /// Initial queue length reported to the pool.
    ///
    /// Always 0: the store, not the pool, knows what is queued.
    pub async fn connect(&self) -> Result<usize, QueueError> {
        debug!(queue_id = %self.queue_id, "Store adapter connected");
        Ok(0)
    }

    /// Payload of a task, with its id injected.
    pub async fn get_task(&self, id: &str) -> Result<Option<Value>, QueueError> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|task| inject_id(task.payload, &task.id)))
    }

    /// Raw tasks of this queue, oldest first.
    pub async fn get_all(&self) -> Result<Vec<Task>, QueueError> {
        self.store.get_all(&self.queue_id).await
    }

    /// Persist a payload as a pending task.
    pub async fn put_task(&self, id: &str, payload: Value, priority: f64) -> Result<(), QueueError> {
        let task = Task::new(self.queue_id.clone(), strip_id(payload))
            .with_id(id)
            .with_priority(normalize_priority(priority));
        debug!(queue_id = %self.queue_id, task_id = %id, priority = task.priority, "Putting task");
        self.store.add(task).await
    }

    /// Claim up to `n` tasks of this queue.
    pub async fn take_first_n(&self, n: usize) -> Result<LockToken, QueueError> {
        self.store.take_first_n(n, &self.queue_id).await
    }

    /// Payloads claimed under `token`, keyed by task id.
    pub async fn get_lock(&self, token: &LockToken) -> Result<HashMap<String, Value>, QueueError> {
        Ok(self
            .store
            .get_lock(token)
            .await?
            .into_iter()
            .map(|(id, task)| {
                let payload = inject_id(task.payload, &id);
                (id, payload)
            })
            .collect())
    }

    /// Claimed payloads in claim order.
    pub async fn get_lock_ordered(
        &self,
        token: &LockToken,
    ) -> Result<Vec<(String, Value)>, QueueError> {
        Ok(self
            .store
            .get_lock_ordered(token)
            .await?
            .into_iter()
            .map(|task| {
                let payload = inject_id(task.payload, &task.id);
                (task.id, payload)
            })
            .collect())
    }

    /// Soft-delete a task.
    pub async fn delete_task(&self, id: &str) -> Result<(), QueueError> {
        self.store.delete(id).await
    }

    /// Release every task claimed under `token`.
    pub async fn release_lock(&self, token: &LockToken) -> Result<(), QueueError> {
        self.store.release_lock(token).await
    }

    /// Record a task outcome.
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), QueueError> {
        self.store.set_status(id, status).await
    }

    /// Running tasks of this queue, payloads carrying their ids.
    pub async fn get_running_tasks(&self) -> Result<HashMap<String, Task>, QueueError> {
        Ok(self
            .store
            .get_running_tasks(&self.queue_id)
            .await?
            .into_iter()
            .map(|(id, mut task)| {
                task.payload = inject_id(task.payload, &id);
                (id, task)
            })
            .collect())
    }
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
