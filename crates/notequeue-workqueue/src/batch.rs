//! All-or-nothing batch execution on a disposable queue.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::pool::{TaskInput, TaskProcessor};
use crate::registry::{QueueOptions, QueueRegistry};

/// Key wrapping each batch item inside its stored payload.
pub const BATCH_ITEM_KEY: &str = "payload";

/// Prefix of disposable batch queue ids.
pub const BATCH_QUEUE_PREFIX: &str = "batch-";

/// Options for [`QueueRegistry::execute_batch_tasks`].
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Items processed at once. Defaults to the registry config.
    pub concurrency: Option<u32>,
}

impl BatchOptions {
    /// Options with a fixed concurrency.
    pub fn with_concurrency(concurrency: u32) -> Self {
        Self {
            concurrency: Some(concurrency),
        }
    }
}

type Settled = (String, Result<Value, QueueError>);

/// Skips every item once one has failed and reports each outcome.
struct PoisoningProcessor {
    inner: Arc<dyn TaskProcessor>,
    poisoned: AtomicBool,
    settled: mpsc::UnboundedSender<Settled>,
}

#[async_trait]
impl TaskProcessor for PoisoningProcessor {
    async fn process(&self, input: TaskInput) -> Result<Value, QueueError> {
        if self.poisoned.load(Ordering::SeqCst) {
            debug!("Skipping batch task {} after an earlier failure", input.id);
            return Err(QueueError::BatchAborted(format!("task {} skipped", input.id)));
        }

        let item = match input.payload {
            Value::Object(mut map) => map.remove(BATCH_ITEM_KEY).unwrap_or(Value::Null),
            other => other,
        };
        let id = input.id;
        let outcome = AssertUnwindSafe(self.inner.process(TaskInput {
            id: id.clone(),
            payload: item,
        }))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(QueueError::ExecutionFailed(format!(
                "processor panicked on task {}",
                id
            )))
        });

        if outcome.is_err() {
            self.poisoned.store(true, Ordering::SeqCst);
        }
        // The batch may already have returned.
        let _ = self.settled.send((id, outcome.clone()));
        outcome
    }
}

impl QueueRegistry {
    /// Run every item through `processor` on a disposable queue.
    ///
    /// Resolves with one result per item, in input order, only if every item
    /// succeeds. Otherwise resolves with the first error and skips the items
    /// not yet started. The disposable queue and its rows are removed in both
    /// cases. An empty input never touches the store.
    pub async fn execute_batch_tasks<T: Serialize>(
        &self,
        options: BatchOptions,
        items: &[T],
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<Vec<Value>, QueueError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let payloads = items
            .iter()
            .map(|item| -> Result<Value, QueueError> {
                let mut wrapper = Map::new();
                wrapper.insert(BATCH_ITEM_KEY.to_string(), serde_json::to_value(item)?);
                Ok(Value::Object(wrapper))
            })
            .collect::<Result<Vec<Value>, QueueError>>()?;

        let queue_id = format!("{}{}", BATCH_QUEUE_PREFIX, Uuid::new_v4());
        let (settled, rx) = mpsc::unbounded_channel();
        let wrapper = Arc::new(PoisoningProcessor {
            inner: processor,
            poisoned: AtomicBool::new(false),
            settled,
        });

        info!(queue_id = %queue_id, items = payloads.len(), "Starting batch");
        let outcome = self.run_batch(&queue_id, options, payloads, wrapper, rx).await;
        let teardown = self.teardown_batch(&queue_id).await;

        match (outcome, teardown) {
            (Ok(results), Ok(())) => {
                info!(queue_id = %queue_id, "Batch succeeded");
                Ok(results)
            }
            (Err(e), _) => {
                warn!(queue_id = %queue_id, error = %e, "Batch failed");
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    async fn run_batch(
        &self,
        queue_id: &str,
        options: BatchOptions,
        payloads: Vec<Value>,
        processor: Arc<dyn TaskProcessor>,
        mut rx: mpsc::UnboundedReceiver<Settled>,
    ) -> Result<Vec<Value>, QueueError> {
        let config = QueueConfig {
            concurrency: options.concurrency.unwrap_or(self.config().concurrency),
            stale_after_secs: None,
            ..self.config().clone()
        };
        let pool = self
            .register(
                queue_id,
                QueueOptions::new()
                    .with_config(config)
                    .with_processor(processor),
            )
            .await?;

        let count = payloads.len();
        let mut index_of = HashMap::with_capacity(count);
        for (index, payload) in payloads.into_iter().enumerate() {
            let id = Uuid::new_v4().to_string();
            // Strictly decreasing so claims follow input order.
            let priority = (count - index) as f64;
            pool.push(&id, payload, priority).await?;
            index_of.insert(id, index);
        }

        let mut results: Vec<Option<Value>> = vec![None; count];
        let mut remaining = count;
        while remaining > 0 {
            let Some((id, outcome)) = rx.recv().await else {
                return Err(QueueError::Shutdown(format!(
                    "batch queue {} stopped early",
                    queue_id
                )));
            };
            let Some(&index) = index_of.get(&id) else {
                continue;
            };
            let value = outcome?;
            if results[index].replace(value).is_none() {
                remaining -= 1;
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn teardown_batch(&self, queue_id: &str) -> Result<(), QueueError> {
        self.destroy(queue_id);
        self.store().clear(queue_id).await
    }
}
