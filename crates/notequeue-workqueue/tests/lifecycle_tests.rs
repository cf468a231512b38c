//! End-to-end queue lifecycle on an on-disk SQLite store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notequeue_workqueue::{
    QueueConfig, QueueError, QueueEvent, QueueOptions, QueueRegistry, SqliteTaskStore,
    StaleTaskPolicy, SyncExecutor, SyncOperation, SyncQueue, TaskInput, TaskOptions,
    TaskRecordStore, TaskStatus, processor_fn,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn fast_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 20,
        ..Default::default()
    }
}

async fn open_store(dir: &TempDir) -> Arc<dyn TaskRecordStore> {
    let path = dir.path().join("tasks.db");
    Arc::new(
        SqliteTaskStore::open(&path, Duration::from_secs(5))
            .await
            .unwrap(),
    )
}

async fn wait_drained(rx: &mut broadcast::Receiver<QueueEvent>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(QueueEvent::Drained { .. }) = rx.recv().await {
                return;
            }
        }
    })
    .await
    .expect("queue did not drain");
}

#[tokio::test]
async fn test_tasks_survive_restart_and_run_in_priority_order() {
    let dir = TempDir::new().unwrap();

    let ids = {
        let registry = QueueRegistry::new(open_store(&dir).await, fast_config());
        let mut ids = Vec::new();
        for priority in [1.0, 10.0, 5.0] {
            let id = registry
                .add(&json!({"p": priority}), TaskOptions::with_priority(priority), "notes")
                .await
                .unwrap();
            ids.push(id);
        }
        registry.shutdown();
        ids
    };

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let processor = processor_fn(move |input: TaskInput| {
        let seen = seen.clone();
        async move {
            seen.lock().push(input.id);
            Ok(Value::Null)
        }
    });

    let registry = QueueRegistry::new(open_store(&dir).await, fast_config());
    let pool = registry
        .register("notes", QueueOptions::new().with_processor(processor))
        .await
        .unwrap();
    let mut rx = pool.subscribe();
    wait_drained(&mut rx).await;

    assert_eq!(*order.lock(), vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
    let counts = registry.store().counts("notes").await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.running, 0);
}

#[tokio::test]
async fn test_abandoned_lock_is_recovered_after_restart() {
    let dir = TempDir::new().unwrap();

    let (id, token) = {
        let store = open_store(&dir).await;
        let registry = QueueRegistry::new(store.clone(), fast_config());
        let id = registry
            .add(&json!({"path": "a.md"}), TaskOptions::default(), "notes")
            .await
            .unwrap();
        let token = store.take_first_n(1, "notes").await.unwrap();
        (id, token)
    };
    assert!(!token.is_empty());

    let registry = QueueRegistry::new(open_store(&dir).await, fast_config());
    let running = registry.get_running_tasks("notes").await.unwrap();
    assert_eq!(running[&id].lock_id.as_deref(), Some(token.as_str()));

    let recovered = registry
        .recover_stale("notes", &StaleTaskPolicy::new(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(recovered, vec![id.clone()]);

    let task = registry.store().get(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.started.is_none());
}

#[tokio::test]
async fn test_delete_during_processing_keeps_task_out_of_claims() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let registry = Arc::new(QueueRegistry::new(store.clone(), fast_config()));

    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = gate.clone();
    let processor = processor_fn(move |input: TaskInput| {
        let entered = entered_tx.clone();
        let release = release.clone();
        async move {
            let _ = entered.send(input.id.clone());
            release.notified().await;
            Ok(json!("late result"))
        }
    });
    let pool = registry
        .register("notes", QueueOptions::new().with_processor(processor))
        .await
        .unwrap();
    let mut rx = pool.subscribe();

    let id = registry.add(&json!({}), TaskOptions::default(), "notes").await.unwrap();
    let entered = tokio::time::timeout(Duration::from_secs(5), entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entered, id);

    store.delete(&id).await.unwrap();
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        TaskStatus::Canceled
    );

    gate.notify_one();
    wait_drained(&mut rx).await;

    let task = store.get(&id).await.unwrap().unwrap();
    assert!(task.is_deleted());
    assert!(task.lock_id.is_none());
    assert!(store.take_first_n(1, "notes").await.unwrap().is_empty());
}

struct RecordingExecutor {
    executed: Mutex<Vec<SyncOperation>>,
    fail_on: Option<String>,
}

#[async_trait]
impl SyncExecutor for RecordingExecutor {
    async fn execute(&self, op: &SyncOperation) -> Result<Value, QueueError> {
        self.executed.lock().push(op.clone());
        if self.fail_on.as_deref() == Some(op.path()) {
            return Err(QueueError::ExecutionFailed(format!("cannot sync {}", op.path())));
        }
        Ok(json!({"synced": op.path()}))
    }
}

fn plan() -> Vec<SyncOperation> {
    vec![
        SyncOperation::Upload {
            path: "draft.md".to_string(),
        },
        SyncOperation::Download {
            path: "shared.md".to_string(),
        },
        SyncOperation::DeleteRemote {
            path: "old.md".to_string(),
        },
    ]
}

#[tokio::test]
async fn test_sync_plan_runs_deletes_first() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(QueueRegistry::new(open_store(&dir).await, fast_config()));
    let executor = Arc::new(RecordingExecutor {
        executed: Mutex::new(Vec::new()),
        fail_on: None,
    });
    let sync = SyncQueue::new(registry.clone(), executor.clone(), None)
        .await
        .unwrap();

    // Hold the queue so the whole plan is stored before anything is claimed.
    sync.pool().pause();
    let ids = sync.enqueue_plan(&plan()).await.unwrap();
    assert_eq!(ids.len(), 3);

    let mut rx = sync.pool().subscribe();
    sync.pool().resume();
    wait_drained(&mut rx).await;

    let paths: Vec<String> = executor
        .executed
        .lock()
        .iter()
        .map(|op| op.path().to_string())
        .collect();
    assert_eq!(paths, vec!["old.md", "shared.md", "draft.md"]);
    assert!(sync.running().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_strict_sync_plan_stops_at_first_failure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let registry = Arc::new(QueueRegistry::new(store.clone(), fast_config()));
    let executor = Arc::new(RecordingExecutor {
        executed: Mutex::new(Vec::new()),
        fail_on: Some("shared.md".to_string()),
    });
    let sync = SyncQueue::new(registry.clone(), executor.clone(), None)
        .await
        .unwrap();

    let err = sync.run_plan_strict(&plan()).await.unwrap_err();
    assert!(err.to_string().contains("cannot sync shared.md"));
    assert_eq!(executor.executed.lock().len(), 2);

    let queues = store.queue_ids().await.unwrap();
    assert!(queues.iter().all(|id| !id.starts_with("batch-")));
}

#[tokio::test]
async fn test_strict_sync_plan_returns_results() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(QueueRegistry::new(open_store(&dir).await, fast_config()));
    let executor = Arc::new(RecordingExecutor {
        executed: Mutex::new(Vec::new()),
        fail_on: None,
    });
    let sync = SyncQueue::new(registry, executor, None).await.unwrap();

    let results = sync.run_plan_strict(&plan()).await.unwrap();
    assert_eq!(
        results,
        vec![
            json!({"synced": "draft.md"}),
            json!({"synced": "shared.md"}),
            json!({"synced": "old.md"}),
        ]
    );
}
