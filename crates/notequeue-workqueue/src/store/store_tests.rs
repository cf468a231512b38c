use super::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

async fn backends() -> Vec<(&'static str, Arc<dyn TaskRecordStore>)> {
    let memory: Arc<dyn TaskRecordStore> = Arc::new(MemoryTaskStore::new());
    let sqlite: Arc<dyn TaskRecordStore> = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
    vec![("memory", memory), ("sqlite", sqlite)]
}

fn task(queue_id: &str, priority: i64) -> Task {
    Task::new(queue_id, serde_json::json!({ "priority": priority })).with_priority(priority)
}

#[tokio::test]
async fn test_add_forces_pending_and_clears_tombstone() {
    for (name, store) in backends().await {
        let mut t = task("q", 0);
        t.status = TaskStatus::Completed;
        t.deleted_at = Some(Utc::now());
        t.lock_id = Some("stale".to_string());
        let id = t.id.clone();

        store.add(t).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending, "{name}");
        assert!(loaded.deleted_at.is_none(), "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_get_missing_returns_none() {
    for (name, store) in backends().await {
        assert!(store.get("nope").await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_re_add_overwrites_instead_of_duplicating() {
    for (name, store) in backends().await {
        let t = task("q", 1).with_id("same");
        store.add(t.clone()).await.unwrap();
        store
            .add(Task::new("q", serde_json::json!({"v": 2})).with_id("same"))
            .await
            .unwrap();

        let all = store.get_all("q").await.unwrap();
        assert_eq!(all.len(), 1, "{name}");
        assert_eq!(all[0].payload, serde_json::json!({"v": 2}), "{name}");
    }
}

#[tokio::test]
async fn test_get_all_is_oldest_first_and_scoped() {
    for (name, store) in backends().await {
        let first = task("q", 5);
        let second = task("q", 1);
        let other = task("other", 9);
        store.add(first.clone()).await.unwrap();
        store.add(second.clone()).await.unwrap();
        store.add(other).await.unwrap();

        let ids: Vec<String> = store.get_all("q").await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id], "{name}");
    }
}

#[tokio::test]
async fn test_operations_on_missing_ids_are_noops() {
    for (name, store) in backends().await {
        store.delete("ghost").await.unwrap();
        store.lock("ghost").await.unwrap();
        store.release("ghost").await.unwrap();
        store.set_status("ghost", TaskStatus::Failed).await.unwrap();
        store.release_lock(&LockToken::from("ghost-lock")).await.unwrap();
        assert!(store.get("ghost").await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_delete_cancels_pending_task() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.take_first_n(1, "q").await.unwrap();

        store.delete(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Canceled, "{name}");
        assert!(loaded.deleted_at.is_some(), "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");
        assert!(loaded.started.is_none(), "{name}");

        // Twice is fine.
        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, TaskStatus::Canceled);
    }
}

#[tokio::test]
async fn test_delete_preserves_terminal_status() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.set_status(&id, TaskStatus::Completed).await.unwrap();

        store.delete(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed, "{name}");
        assert!(loaded.deleted_at.is_some(), "{name}");
    }
}

#[tokio::test]
async fn test_lock_after_delete_is_noop() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.delete(&id).await.unwrap();

        store.lock(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Canceled, "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");
        assert!(loaded.started.is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_lock_marks_processing_without_token() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();

        store.lock(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing, "{name}");
        assert!(loaded.started.is_some(), "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");

        // A single-task lock still keeps it out of batch claims.
        assert!(store.take_first_n(5, "q").await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_release_returns_non_terminal_to_pending() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.take_first_n(1, "q").await.unwrap();

        store.release(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending, "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");
        assert!(loaded.started.is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_release_keeps_terminal_status() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.take_first_n(1, "q").await.unwrap();
        store.set_status(&id, TaskStatus::Failed).await.unwrap();

        store.release(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed, "{name}");
        assert!(loaded.lock_id.is_none(), "{name}");
        assert!(loaded.started.is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_release_on_deleted_task_is_noop() {
    for (name, store) in backends().await {
        let t = task("q", 0);
        let id = t.id.clone();
        store.add(t).await.unwrap();
        store.delete(&id).await.unwrap();

        store.release(&id).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Canceled, "{name}");
        assert!(loaded.deleted_at.is_some(), "{name}");
    }
}

#[tokio::test]
async fn test_take_first_n_claims_highest_priority() {
    for (name, store) in backends().await {
        let p1 = task("q", 1);
        let p10 = task("q", 10);
        let p5 = task("q", 5);
        for t in [&p1, &p10, &p5] {
            store.add(t.clone()).await.unwrap();
        }

        let token = store.take_first_n(2, "q").await.unwrap();
        assert!(!token.is_empty(), "{name}");

        let claimed = store.get_lock(&token).await.unwrap();
        let ids: HashSet<&String> = claimed.keys().collect();
        assert_eq!(ids, HashSet::from([&p10.id, &p5.id]), "{name}");
        for t in claimed.values() {
            assert_eq!(t.status, TaskStatus::Processing, "{name}");
            assert_eq!(t.lock_id.as_deref(), Some(token.as_str()), "{name}");
            assert!(t.started.is_some(), "{name}");
        }

        let rest = store.get(&p1.id).await.unwrap().unwrap();
        assert_eq!(rest.status, TaskStatus::Pending, "{name}");
        assert!(rest.lock_id.is_none(), "{name}");

        let ordered: Vec<i64> = store
            .get_lock_ordered(&token)
            .await
            .unwrap()
            .iter()
            .map(|t| t.priority)
            .collect();
        assert_eq!(ordered, vec![10, 5], "{name}");
    }
}

#[tokio::test]
async fn test_take_first_n_is_fifo_within_priority() {
    for (name, store) in backends().await {
        let ids: Vec<String> = {
            let mut ids = Vec::new();
            for _ in 0..4 {
                let t = task("q", 3);
                ids.push(t.id.clone());
                store.add(t).await.unwrap();
            }
            ids
        };

        let token = store.take_first_n(2, "q").await.unwrap();
        let claimed: HashSet<String> = store.get_lock(&token).await.unwrap().into_keys().collect();
        assert_eq!(claimed, HashSet::from([ids[0].clone(), ids[1].clone()]), "{name}");
    }
}

#[tokio::test]
async fn test_batch_order_breaks_ties_by_insertion() {
    for (name, store) in backends().await {
        let added = Utc::now();
        for queue_id in ["single", "batch"] {
            for id in ["zzz", "aaa"] {
                let mut t = task(queue_id, 1).with_id(format!("{queue_id}-{id}"));
                t.added = added;
                store.add(t).await.unwrap();
            }
        }

        let single = store.take_first_n(1, "single").await.unwrap();
        let first: Vec<String> = store.get_lock(&single).await.unwrap().into_keys().collect();
        assert_eq!(first, vec!["single-zzz".to_string()], "{name}");

        let batch = store.take_first_n(2, "batch").await.unwrap();
        let ordered: Vec<String> = store
            .get_lock_ordered(&batch)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ordered, vec!["batch-zzz".to_string(), "batch-aaa".to_string()], "{name}");
    }
}

#[tokio::test]
async fn test_take_first_n_on_empty_queue_returns_sentinel() {
    for (name, store) in backends().await {
        let token = store.take_first_n(5, "empty").await.unwrap();
        assert!(token.is_empty(), "{name}");
        assert!(store.get_lock(&token).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_take_first_n_skips_locked_deleted_and_finished() {
    for (name, store) in backends().await {
        let locked = task("q", 9);
        let deleted = task("q", 8);
        let finished = task("q", 7);
        let eligible = task("q", 1);
        for t in [&locked, &deleted, &finished, &eligible] {
            store.add(t.clone()).await.unwrap();
        }
        let first = store.take_first_n(1, "q").await.unwrap();
        assert!(store.get_lock(&first).await.unwrap().contains_key(&locked.id));
        store.delete(&deleted.id).await.unwrap();
        store.set_status(&finished.id, TaskStatus::Completed).await.unwrap();

        let second = store.take_first_n(10, "q").await.unwrap();
        let claimed = store.get_lock(&second).await.unwrap();
        assert_eq!(claimed.len(), 1, "{name}");
        assert!(claimed.contains_key(&eligible.id), "{name}");

        assert!(store.take_first_n(10, "q").await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_take_zero_claims_nothing() {
    for (name, store) in backends().await {
        store.add(task("q", 0)).await.unwrap();
        assert!(store.take_first_n(0, "q").await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_get_lock_excludes_deleted_tasks() {
    for (name, store) in backends().await {
        let a = task("q", 0);
        let b = task("q", 0);
        store.add(a.clone()).await.unwrap();
        store.add(b.clone()).await.unwrap();
        let token = store.take_first_n(2, "q").await.unwrap();

        store.delete(&a.id).await.unwrap();
        let claimed = store.get_lock(&token).await.unwrap();
        assert_eq!(claimed.len(), 1, "{name}");

        store.delete(&b.id).await.unwrap();
        assert!(store.get_lock(&token).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_get_running_tasks() {
    for (name, store) in backends().await {
        let a = task("q", 2);
        let b = task("q", 1);
        let other = task("other", 5);
        for t in [&a, &b, &other] {
            store.add(t.clone()).await.unwrap();
        }
        store.take_first_n(1, "q").await.unwrap();
        store.take_first_n(1, "other").await.unwrap();

        let running = store.get_running_tasks("q").await.unwrap();
        assert_eq!(running.len(), 1, "{name}");
        assert!(running.contains_key(&a.id), "{name}");

        store.delete(&a.id).await.unwrap();
        assert!(store.get_running_tasks("q").await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_release_lock_keeps_terminal_and_requeues_the_rest() {
    for (name, store) in backends().await {
        let done = task("q", 2);
        let unfinished = task("q", 1);
        store.add(done.clone()).await.unwrap();
        store.add(unfinished.clone()).await.unwrap();

        let token = store.take_first_n(2, "q").await.unwrap();
        store.set_status(&done.id, TaskStatus::Completed).await.unwrap();
        store.release_lock(&token).await.unwrap();

        let done = store.get(&done.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{name}");
        assert!(done.lock_id.is_none(), "{name}");

        let unfinished = store.get(&unfinished.id).await.unwrap().unwrap();
        assert_eq!(unfinished.status, TaskStatus::Pending, "{name}");
        assert!(store.get_lock(&token).await.unwrap().is_empty(), "{name}");

        // Unfinished work is claimable again.
        let again = store.take_first_n(5, "q").await.unwrap();
        assert_eq!(store.get_lock(&again).await.unwrap().len(), 1, "{name}");
    }
}

#[tokio::test]
async fn test_clear_removes_only_one_queue() {
    for (name, store) in backends().await {
        store.add(task("q", 0)).await.unwrap();
        store.add(task("q", 0)).await.unwrap();
        store.add(task("keep", 0)).await.unwrap();

        store.clear("q").await.unwrap();
        assert!(store.get_all("q").await.unwrap().is_empty(), "{name}");
        assert_eq!(store.get_all("keep").await.unwrap().len(), 1, "{name}");
    }
}

#[tokio::test]
async fn test_counts_and_queue_ids() {
    for (name, store) in backends().await {
        let a = task("q", 3);
        let b = task("q", 2);
        let c = task("q", 1);
        for t in [&a, &b, &c] {
            store.add(t.clone()).await.unwrap();
        }
        store.add(task("z", 0)).await.unwrap();
        store.take_first_n(1, "q").await.unwrap();
        store.delete(&c.id).await.unwrap();

        let counts = store.counts("q").await.unwrap();
        assert_eq!(counts.processing, 1, "{name}");
        assert_eq!(counts.pending, 1, "{name}");
        assert_eq!(counts.canceled, 1, "{name}");
        assert_eq!(counts.deleted, 1, "{name}");
        assert_eq!(counts.running, 1, "{name}");
        assert_eq!(counts.total(), 3, "{name}");

        assert_eq!(store.queue_ids().await.unwrap(), vec!["q".to_string(), "z".to_string()]);
    }
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data").join("tasks.db");

    let t = task("q", 4);
    {
        let store = SqliteTaskStore::open(&path, Duration::from_secs(5)).await.unwrap();
        store.add(t.clone()).await.unwrap();
        store.take_first_n(1, "q").await.unwrap();
    }

    let store = SqliteTaskStore::open(&path, Duration::from_secs(5)).await.unwrap();
    let loaded = store.get(&t.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Processing);
    assert_eq!(loaded.payload, serde_json::json!({ "priority": 4 }));
    // A claim left by a dead process stays discoverable.
    assert_eq!(store.get_running_tasks("q").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sqlite_concurrent_claims_are_disjoint() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tasks.db");
    let a = Arc::new(SqliteTaskStore::open(&path, Duration::from_secs(10)).await.unwrap());
    let b = Arc::new(SqliteTaskStore::open(&path, Duration::from_secs(10)).await.unwrap());

    for i in 0..40 {
        a.add(task("q", i % 4)).await.unwrap();
    }

    let mut handles = Vec::new();
    for store in [a.clone(), b.clone(), a.clone(), b.clone()] {
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let token = store.take_first_n(3, "q").await.unwrap();
                if token.is_empty() {
                    break;
                }
                claimed.extend(store.get_lock(&token).await.unwrap().into_keys());
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "task claimed twice");
        }
    }
    assert_eq!(total, 40);
}

#[tokio::test]
async fn test_memory_concurrent_claims_are_disjoint() {
    let store = Arc::new(MemoryTaskStore::new());
    for i in 0..30 {
        store.add(task("q", i % 3)).await.unwrap();
    }

    let (x, y) = tokio::join!(store.take_first_n(20, "q"), store.take_first_n(20, "q"));
    let x = store.get_lock(&x.unwrap()).await.unwrap();
    let y = store.get_lock(&y.unwrap()).await.unwrap();
    assert_eq!(x.len() + y.len(), 30);
    assert!(x.keys().all(|id| !y.contains_key(id)));
}
