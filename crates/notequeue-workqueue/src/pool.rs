//! Worker pool that drains one queue through a processor.
//!
//! The dispatcher claims batches through the [`StoreAdapter`], hands each
//! batch to a spawned worker and keeps at most `concurrency` batches in
//! flight. Workers record the outcome of every task before releasing the
//! lock, so a finished task never becomes claimable again.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::StoreAdapter;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::stats::{PoolStats, QueueStats};
use crate::task::{LockToken, TaskStatus};

/// What a processor receives for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput {
    /// Task id.
    pub id: String,
    /// Stored payload, with the id injected for object payloads.
    pub payload: Value,
}

/// Executes the payload of a claimed task.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Process one task. An `Err` marks the task failed.
    async fn process(&self, input: TaskInput) -> Result<Value, QueueError>;
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueueError>> + Send,
{
    async fn process(&self, input: TaskInput) -> Result<Value, QueueError> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn TaskProcessor>
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueueError>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Lifecycle events published by a pool.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A task entered its processor.
    TaskStarted { queue_id: String, task_id: String },
    /// A task's processor returned a value.
    TaskFinished {
        queue_id: String,
        task_id: String,
        result: Value,
    },
    /// A task's processor returned an error or panicked.
    TaskFailed {
        queue_id: String,
        task_id: String,
        error: QueueError,
    },
    /// Nothing claimable is left and no batch is in flight.
    Drained { queue_id: String },
}

impl QueueEvent {
    /// Queue the event belongs to.
    pub fn queue_id(&self) -> &str {
        match self {
            QueueEvent::TaskStarted { queue_id, .. }
            | QueueEvent::TaskFinished { queue_id, .. }
            | QueueEvent::TaskFailed { queue_id, .. }
            | QueueEvent::Drained { queue_id } => queue_id,
        }
    }
}

/// Worker pool bound to one queue.
pub struct WorkerPool {
    config: QueueConfig,
    adapter: Arc<StoreAdapter>,
    processor: Option<Arc<dyn TaskProcessor>>,
    semaphore: Arc<Semaphore>,
    paused: AtomicBool,
    wake: Notify,
    shutdown: CancellationToken,
    events: broadcast::Sender<QueueEvent>,
    stats: PoolStats,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool. Nothing is dispatched until [`WorkerPool::start`].
    pub fn new(
        adapter: StoreAdapter,
        config: QueueConfig,
        processor: Option<Arc<dyn TaskProcessor>>,
    ) -> Arc<Self> {
        let permits = config.concurrency.max(1) as usize;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            config,
            adapter: Arc::new(adapter),
            processor,
            semaphore: Arc::new(Semaphore::new(permits)),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            events,
            stats: PoolStats::new(),
            dispatcher: Mutex::new(None),
        })
    }

    /// Queue this pool drains.
    pub fn queue_id(&self) -> &str {
        self.adapter.queue_id()
    }

    /// Pool configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Store adapter used by this pool.
    pub fn adapter(&self) -> &Arc<StoreAdapter> {
        &self.adapter
    }

    /// Whether a processor is attached.
    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }

    /// Spawn the dispatcher. A pool without a processor only persists tasks.
    pub fn start(self: &Arc<Self>) {
        let Some(processor) = self.processor.clone() else {
            debug!("Queue {} has no processor, tasks will be stored only", self.queue_id());
            return;
        };
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        *dispatcher = Some(tokio::spawn(self.clone().run(processor)));
    }

    /// Whether the dispatcher is running.
    pub fn is_dispatching(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Store a payload as a pending task and wake the dispatcher.
    pub async fn push(&self, id: &str, payload: Value, priority: f64) -> Result<(), QueueError> {
        self.adapter.put_task(id, payload, priority).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Wake the dispatcher to look for claimable tasks.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Cancel a task of this queue.
    pub async fn cancel(&self, id: &str) -> Result<(), QueueError> {
        self.adapter.delete_task(id).await
    }

    /// Stop claiming new batches. In-flight batches finish.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Queue {} paused", self.queue_id());
        }
    }

    /// Resume claiming.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Queue {} resumed", self.queue_id());
        }
        self.wake.notify_one();
    }

    /// Check if the pool is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher for good.
    ///
    /// Batches already claimed stop after their current task and release
    /// the rest of their lock.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Queue {} shutting down", self.queue_id());
            self.shutdown.cancel();
        }
    }

    /// Check if the pool was shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Subscribe to this pool's events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Get a snapshot of the pool's statistics.
    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    /// Number of claimed batches currently in flight.
    pub fn batches_in_flight(&self) -> usize {
        self.permits() - self.semaphore.available_permits()
    }

    fn permits(&self) -> usize {
        self.config.concurrency.max(1) as usize
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(self.config.poll_interval()) => {}
        }
    }

    async fn run(self: Arc<Self>, processor: Arc<dyn TaskProcessor>) {
        if let Err(e) = self.adapter.connect().await {
            error!("Queue {} failed to connect: {}", self.queue_id(), e);
            return;
        }
        info!(
            "Worker pool for {} started with concurrency {} and batch size {}",
            self.queue_id(),
            self.permits(),
            self.config.batch_size
        );

        let batch_size = self.config.batch_size.max(1) as usize;
        let mut had_work = false;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.is_paused() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.wake.notified() => continue,
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if self.is_paused() || self.shutdown.is_cancelled() {
                continue;
            }

            match self.adapter.take_first_n(batch_size).await {
                Ok(token) if token.is_empty() => {
                    drop(permit);
                    if had_work && self.batches_in_flight() == 0 {
                        had_work = false;
                        debug!("Queue {} drained", self.queue_id());
                        self.emit(QueueEvent::Drained {
                            queue_id: self.queue_id().to_string(),
                        });
                    }
                    self.idle().await;
                }
                Ok(token) if self.is_paused() || self.shutdown.is_cancelled() => {
                    // Paused while claiming: hand the tasks back untouched.
                    drop(permit);
                    if let Err(e) = self.adapter.release_lock(&token).await {
                        error!("Queue {} failed to release lock {}: {}", self.queue_id(), token, e);
                    }
                }
                Ok(token) => {
                    had_work = true;
                    let pool = self.clone();
                    let processor = processor.clone();
                    tokio::spawn(async move {
                        pool.work(&token, &processor).await;
                        drop(permit);
                        pool.wake.notify_one();
                    });
                }
                Err(e) => {
                    drop(permit);
                    error!("Queue {} failed to claim tasks: {}", self.queue_id(), e);
                    self.idle().await;
                }
            }
        }

        info!("Worker pool for {} stopped", self.queue_id());
    }

    async fn work(&self, token: &LockToken, processor: &Arc<dyn TaskProcessor>) {
        match self.adapter.get_lock_ordered(token).await {
            Ok(tasks) => {
                debug!("Queue {} processing {} task(s) under {}", self.queue_id(), tasks.len(), token);
                for (id, payload) in tasks {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    if !self.still_claimed(&id, token).await {
                        debug!("Skipping task {} on {}, no longer claimed", id, self.queue_id());
                        continue;
                    }
                    self.run_task(processor, id, payload).await;
                }
            }
            Err(e) => error!("Queue {} failed to read lock {}: {}", self.queue_id(), token, e),
        }

        if let Err(e) = self.adapter.release_lock(token).await {
            error!("Queue {} failed to release lock {}: {}", self.queue_id(), token, e);
        }
    }

    /// A task deleted, released or re-added after the claim must not run.
    async fn still_claimed(&self, id: &str, token: &LockToken) -> bool {
        match self.adapter.store().get(id).await {
            Ok(Some(task)) => {
                !task.is_deleted()
                    && task.status == TaskStatus::Processing
                    && task.lock_id.as_deref() == Some(token.as_str())
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to re-read task {}: {}", id, e);
                false
            }
        }
    }

    async fn run_task(&self, processor: &Arc<dyn TaskProcessor>, id: String, payload: Value) {
        let queue_id = self.queue_id().to_string();
        self.stats.record_started();
        self.emit(QueueEvent::TaskStarted {
            queue_id: queue_id.clone(),
            task_id: id.clone(),
        });

        let started = Instant::now();
        let input = TaskInput {
            id: id.clone(),
            payload,
        };
        let outcome = AssertUnwindSafe(processor.process(input))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(QueueError::ExecutionFailed(format!(
                    "processor panicked on task {}",
                    id
                )))
            });
        self.stats.record_finished(started.elapsed(), outcome.is_ok());

        let status = if outcome.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if let Err(e) = self.adapter.set_status(&id, status).await {
            error!("Failed to record status of task {}: {}", id, e);
        }

        match outcome {
            Ok(result) => {
                debug!("Task {} completed on {}", id, queue_id);
                self.emit(QueueEvent::TaskFinished {
                    queue_id,
                    task_id: id,
                    result,
                });
            }
            Err(error) => {
                warn!("Task {} failed on {}: {}", id, queue_id, error);
                self.emit(QueueEvent::TaskFailed {
                    queue_id,
                    task_id: id,
                    error,
                });
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
