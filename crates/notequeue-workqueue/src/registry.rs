//! Registry owning one worker pool per named queue.
//!
//! This is the application-facing API: producers call [`QueueRegistry::add`],
//! consumers register a [`TaskProcessor`] for their queue, and tooling
//! inspects running tasks and statistics.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{PRIORITY_KEY, StoreAdapter, payload_priority};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::pool::{QueueEvent, TaskProcessor, WorkerPool};
use crate::recovery::{self, StaleTaskPolicy};
use crate::stats::QueueStats;
use crate::store::TaskRecordStore;
use crate::task::{Task, TaskOptions, TaskStatus};

/// Queue used by [`QueueRegistry::add_default`].
pub const DEFAULT_QUEUE: &str = "default";

/// Options for registering a queue.
#[derive(Clone, Default)]
pub struct QueueOptions {
    /// Overrides the registry-wide queue config.
    pub config: Option<QueueConfig>,
    /// Processor draining the queue. Falls back to the registry default.
    pub processor: Option<Arc<dyn TaskProcessor>>,
}

impl QueueOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the processor.
    pub fn with_processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Set the queue config.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }
}

struct QueueHandle {
    pool: Arc<WorkerPool>,
    listener: JoinHandle<()>,
}

/// Registry of queues backed by one task record store.
pub struct QueueRegistry {
    store: Arc<dyn TaskRecordStore>,
    config: QueueConfig,
    default_processor: Option<Arc<dyn TaskProcessor>>,
    queues: DashMap<String, QueueHandle>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueRegistry {
    /// Create a registry.
    pub fn new(store: Arc<dyn TaskRecordStore>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            config,
            default_processor: None,
            queues: DashMap::new(),
            events,
        }
    }

    /// Processor used for queues created without one.
    pub fn with_default_processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.default_processor = Some(processor);
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn TaskRecordStore> {
        &self.store
    }

    /// Registry-wide queue config.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register a queue, or return the pool already registered under `queue_id`.
    ///
    /// When the queue's config enables stale recovery, abandoned tasks are
    /// released before the pool starts.
    pub async fn register(
        &self,
        queue_id: &str,
        options: QueueOptions,
    ) -> Result<Arc<WorkerPool>, QueueError> {
        if let Some(pool) = self.get(queue_id) {
            return Ok(pool);
        }

        let config = options.config.unwrap_or_else(|| self.config.clone());
        if let Some(policy) = StaleTaskPolicy::from_config(&config) {
            recovery::recover_stale(self.store.as_ref(), queue_id, &policy).await?;
        }

        let processor = options.processor.or_else(|| self.default_processor.clone());
        let pool = self
            .queues
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                let adapter = StoreAdapter::new(self.store.clone(), queue_id);
                let pool = WorkerPool::new(adapter, config, processor);
                let listener = self.spawn_listener(&pool);
                pool.start();
                info!(queue_id, "Queue registered");
                QueueHandle { pool, listener }
            })
            .pool
            .clone();
        Ok(pool)
    }

    fn spawn_listener(&self, pool: &Arc<WorkerPool>) -> JoinHandle<()> {
        let mut rx = pool.subscribe();
        let forward = self.events.clone();
        let queue_id = pool.queue_id().to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        match &event {
                            QueueEvent::TaskFinished { task_id, .. } => {
                                debug!(queue_id = %queue_id, task_id = %task_id, "Task settled as completed");
                            }
                            QueueEvent::TaskFailed { task_id, error, .. } => {
                                warn!(queue_id = %queue_id, task_id = %task_id, error = %error, "Task settled as failed");
                            }
                            _ => {}
                        }
                        let _ = forward.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(queue_id = %queue_id, skipped, "Event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Pool of a queue, creating the queue if needed.
    async fn ensure(&self, queue_id: &str) -> Result<Arc<WorkerPool>, QueueError> {
        if let Some(pool) = self.get(queue_id) {
            return Ok(pool);
        }
        self.register(queue_id, QueueOptions::default()).await
    }

    /// Pool of a registered queue.
    pub fn get(&self, queue_id: &str) -> Option<Arc<WorkerPool>> {
        self.queues.get(queue_id).map(|handle| handle.pool.clone())
    }

    /// Check if a queue is registered.
    pub fn contains(&self, queue_id: &str) -> bool {
        self.queues.contains_key(queue_id)
    }

    /// Ids of the registered queues, sorted.
    pub fn queue_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Enqueue a payload, creating the queue if needed. Returns the new task id.
    ///
    /// The task is durably stored when this returns; processing happens later.
    /// A forced priority in `options` wins over a `priority` field on the payload
    /// and is merged into object payloads.
    pub async fn add<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        options: TaskOptions,
        queue_id: &str,
    ) -> Result<String, QueueError> {
        let pool = self.ensure(queue_id).await?;
        let mut payload = serde_json::to_value(payload)?;

        let priority = match options.priority {
            Some(forced) => {
                if let (Value::Object(map), Some(number)) =
                    (&mut payload, serde_json::Number::from_f64(forced))
                {
                    map.insert(PRIORITY_KEY.to_string(), Value::Number(number));
                }
                forced
            }
            None => payload_priority(&payload).unwrap_or(0.0),
        };

        let id = Uuid::new_v4().to_string();
        pool.push(&id, payload, priority).await?;
        debug!(queue_id, task_id = %id, "Task added");
        Ok(id)
    }

    /// Enqueue on [`DEFAULT_QUEUE`].
    pub async fn add_default<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        options: TaskOptions,
    ) -> Result<String, QueueError> {
        self.add(payload, options, DEFAULT_QUEUE).await
    }

    /// Stop dispatching a queue. Queued tasks stay stored.
    pub fn pause(&self, queue_id: &str) -> Result<(), QueueError> {
        self.get(queue_id)
            .map(|pool| pool.pause())
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }

    /// Restart dispatching a paused queue.
    pub fn resume(&self, queue_id: &str) -> Result<(), QueueError> {
        self.get(queue_id)
            .map(|pool| pool.resume())
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }

    /// Tear down a queue's pool and listener. Stored tasks are untouched.
    ///
    /// Returns false if the queue was not registered.
    pub fn destroy(&self, queue_id: &str) -> bool {
        match self.queues.remove(queue_id) {
            Some((_, handle)) => {
                handle.listener.abort();
                handle.pool.shutdown();
                info!(queue_id, "Queue destroyed");
                true
            }
            None => false,
        }
    }

    /// Destroy every registered queue.
    pub fn shutdown(&self) {
        for queue_id in self.queue_ids() {
            self.destroy(&queue_id);
        }
    }

    /// Cancel every open task of a queue, then purge its rows.
    ///
    /// The queue is paused for the duration and resumed afterwards, even on error.
    pub async fn clear(&self, queue_id: &str) -> Result<(), QueueError> {
        let pool = self.ensure(queue_id).await?;
        let was_paused = pool.is_paused();
        pool.pause();

        let result: Result<(), QueueError> = async {
            let open: Vec<Task> = self
                .store
                .get_all(queue_id)
                .await?
                .into_iter()
                .filter(|task| {
                    !task.is_deleted()
                        && matches!(task.status, TaskStatus::Pending | TaskStatus::Processing)
                })
                .collect();
            let cancellations = open.iter().map(|task| pool.cancel(&task.id));
            for outcome in futures::future::join_all(cancellations).await {
                outcome?;
            }
            self.store.clear(queue_id).await?;
            info!(queue_id, canceled = open.len(), "Queue cleared");
            Ok(())
        }
        .await;

        if !was_paused {
            pool.resume();
        }
        result
    }

    /// Statistics of a queue, creating the queue if needed.
    pub async fn get_stats(&self, queue_id: &str) -> Result<QueueStats, QueueError> {
        Ok(self.ensure(queue_id).await?.stats())
    }

    /// Events of one queue, creating the queue if needed.
    pub async fn subscribe(
        &self,
        queue_id: &str,
    ) -> Result<broadcast::Receiver<QueueEvent>, QueueError> {
        Ok(self.ensure(queue_id).await?.subscribe())
    }

    /// Events of every queue, as forwarded by the per-queue listeners.
    pub fn subscribe_all(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Running tasks of a queue, payloads carrying their ids.
    pub async fn get_running_tasks(
        &self,
        queue_id: &str,
    ) -> Result<HashMap<String, Task>, QueueError> {
        StoreAdapter::new(self.store.clone(), queue_id)
            .get_running_tasks()
            .await
    }

    /// Release stale tasks of a queue under `policy`.
    pub async fn recover_stale(
        &self,
        queue_id: &str,
        policy: &StaleTaskPolicy,
    ) -> Result<Vec<String>, QueueError> {
        let recovered = recovery::recover_stale(self.store.as_ref(), queue_id, policy).await?;
        if !recovered.is_empty() {
            if let Some(pool) = self.get(queue_id) {
                pool.notify();
            }
        }
        Ok(recovered)
    }
}

impl Drop for QueueRegistry {
    fn drop(&mut self) {
        for entry in self.queues.iter() {
            entry.listener.abort();
            entry.pool.shutdown();
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
