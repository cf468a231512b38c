//! Sync operations executed through the task queue.
//!
//! A sync plan is a list of file operations produced elsewhere (by diffing
//! local and remote state). Each operation is queued on [`SYNC_QUEUE`] so a
//! crash mid-plan leaves the rest of the plan persisted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::batch::BatchOptions;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::pool::{TaskInput, TaskProcessor, WorkerPool};
use crate::registry::{QueueOptions, QueueRegistry};
use crate::task::{Task, TaskOptions};

/// Queue sync operations run on.
pub const SYNC_QUEUE: &str = "sync";

/// One step of a sync plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOperation {
    /// Push a local file to the remote.
    Upload { path: String },
    /// Pull a remote file.
    Download { path: String },
    /// Remove a file from the remote.
    DeleteRemote { path: String },
    /// Remove a local file.
    DeleteLocal { path: String },
}

impl SyncOperation {
    /// Path the operation touches.
    pub fn path(&self) -> &str {
        match self {
            SyncOperation::Upload { path }
            | SyncOperation::Download { path }
            | SyncOperation::DeleteRemote { path }
            | SyncOperation::DeleteLocal { path } => path,
        }
    }

    /// Deletes run before transfers, downloads before uploads.
    pub fn default_priority(&self) -> f64 {
        match self {
            SyncOperation::DeleteRemote { .. } | SyncOperation::DeleteLocal { .. } => 20.0,
            SyncOperation::Download { .. } => 10.0,
            SyncOperation::Upload { .. } => 0.0,
        }
    }
}

/// Performs the I/O of a sync operation.
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    /// Execute one operation.
    async fn execute(&self, op: &SyncOperation) -> Result<Value, QueueError>;
}

/// Decodes queued payloads into operations for a [`SyncExecutor`].
pub struct SyncProcessor {
    executor: Arc<dyn SyncExecutor>,
}

impl SyncProcessor {
    /// Wrap an executor.
    pub fn new(executor: Arc<dyn SyncExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskProcessor for SyncProcessor {
    async fn process(&self, input: TaskInput) -> Result<Value, QueueError> {
        let op: SyncOperation = serde_json::from_value(input.payload)?;
        debug!("Executing {:?} for task {}", op, input.id);
        self.executor.execute(&op).await
    }
}

/// Queue-backed sync plan runner.
pub struct SyncQueue {
    registry: Arc<QueueRegistry>,
    processor: Arc<dyn TaskProcessor>,
    pool: Arc<WorkerPool>,
}

impl SyncQueue {
    /// Register [`SYNC_QUEUE`] with a processor driving `executor`.
    pub async fn new(
        registry: Arc<QueueRegistry>,
        executor: Arc<dyn SyncExecutor>,
        config: Option<QueueConfig>,
    ) -> Result<Self, QueueError> {
        let processor: Arc<dyn TaskProcessor> = Arc::new(SyncProcessor::new(executor));
        let mut options = QueueOptions::new().with_processor(processor.clone());
        options.config = config;
        let pool = registry.register(SYNC_QUEUE, options).await?;
        Ok(Self {
            registry,
            processor,
            pool,
        })
    }

    /// Pool draining the sync queue.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Queue every operation. Failures are reported per task through events.
    pub async fn enqueue_plan(&self, ops: &[SyncOperation]) -> Result<Vec<String>, QueueError> {
        let mut ids = Vec::with_capacity(ops.len());
        for op in ops {
            let options = TaskOptions::with_priority(op.default_priority());
            ids.push(self.registry.add(op, options, SYNC_QUEUE).await?);
        }
        info!("Queued sync plan of {} operation(s)", ids.len());
        Ok(ids)
    }

    /// Run the operations in order, stopping at the first failure.
    pub async fn run_plan_strict(&self, ops: &[SyncOperation]) -> Result<Vec<Value>, QueueError> {
        self.registry
            .execute_batch_tasks(BatchOptions::with_concurrency(1), ops, self.processor.clone())
            .await
    }

    /// Operations currently being executed.
    pub async fn running(&self) -> Result<HashMap<String, Task>, QueueError> {
        self.registry.get_running_tasks(SYNC_QUEUE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_serde() {
        let op = SyncOperation::DeleteRemote {
            path: "notes/a.md".to_string(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"op": "delete_remote", "path": "notes/a.md"}));

        let decoded: SyncOperation =
            serde_json::from_value(json!({"op": "upload", "path": "b.md", "id": "t1", "priority": 0}))
                .unwrap();
        assert_eq!(decoded.path(), "b.md");
    }

    #[test]
    fn test_default_priority_orders_deletes_first() {
        let delete = SyncOperation::DeleteLocal { path: "a".into() };
        let download = SyncOperation::Download { path: "a".into() };
        let upload = SyncOperation::Upload { path: "a".into() };
        assert!(delete.default_priority() > download.default_priority());
        assert!(download.default_priority() > upload.default_priority());
    }

    #[tokio::test]
    async fn test_processor_rejects_unknown_payload() {
        struct Never;

        #[async_trait]
        impl SyncExecutor for Never {
            async fn execute(&self, _op: &SyncOperation) -> Result<Value, QueueError> {
                Ok(Value::Null)
            }
        }

        let processor = SyncProcessor::new(Arc::new(Never));
        let result = processor
            .process(TaskInput {
                id: "t".to_string(),
                payload: json!({"op": "teleport"}),
            })
            .await;
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }
}
