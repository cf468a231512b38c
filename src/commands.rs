//! Subcommand handlers for notequeue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use notequeue_config::Config;
use notequeue_workqueue::{
    LockToken, QueueConfig, QueueRegistry, SqliteTaskStore, StaleTaskPolicy, StoreConfig, Task,
    TaskOptions, TaskRecordStore,
};

use crate::cli::Commands;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Open the configured store and run one subcommand against it.
pub(crate) async fn handle_command(
    command: Commands,
    config: &Config,
    db: Option<PathBuf>,
) -> CommandResult {
    let mut store_config = StoreConfig::from(&config.store);
    if db.is_some() {
        store_config.db_path = db;
    }
    let store: Arc<dyn TaskRecordStore> = Arc::new(SqliteTaskStore::from_config(&store_config).await?);

    // The CLI only produces and inspects; recovery is explicit.
    let queue_config = QueueConfig {
        stale_after_secs: None,
        ..QueueConfig::from(&config.queue)
    };
    let registry = QueueRegistry::new(store.clone(), queue_config);

    match command {
        Commands::Add {
            queue,
            priority,
            payload,
        } => add(&registry, &queue, priority, &payload).await,
        Commands::Get { id } => get(store.as_ref(), &id).await,
        Commands::List { queue, format } => list(store.as_ref(), &queue, &format).await,
        Commands::Running { queue } => running(&registry, &queue).await,
        Commands::Counts { queue } => counts(store.as_ref(), &queue).await,
        Commands::Delete { id } => {
            store.delete(&id).await?;
            println!("Deleted {}", id);
            Ok(())
        }
        Commands::Release { lock } => {
            store.release_lock(&LockToken::from(lock.as_str())).await?;
            println!("Released lock {}", lock);
            Ok(())
        }
        Commands::Recover { queue, older_than } => {
            let policy = StaleTaskPolicy::new(Duration::from_secs(older_than));
            let recovered = registry.recover_stale(&queue, &policy).await?;
            println!("Recovered {} task(s) on {}", recovered.len(), queue);
            for id in recovered {
                println!("  {}", id);
            }
            Ok(())
        }
        Commands::Clear { queue } => {
            registry.clear(&queue).await?;
            registry.shutdown();
            println!("Cleared queue {}", queue);
            Ok(())
        }
        Commands::Queues => {
            let queues = store.queue_ids().await?;
            if queues.is_empty() {
                println!("No queues found.");
            }
            for queue in queues {
                println!("{}", queue);
            }
            Ok(())
        }
    }
}

async fn add(
    registry: &QueueRegistry,
    queue: &str,
    priority: Option<f64>,
    payload: &str,
) -> CommandResult {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let options = TaskOptions { priority };
    let id = registry.add(&payload, options, queue).await?;
    registry.shutdown();
    info!("Added task {} to {}", id, queue);
    println!("{}", id);
    Ok(())
}

async fn get(store: &dyn TaskRecordStore, id: &str) -> CommandResult {
    match store.get(id).await? {
        Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
        None => println!("Task not found: {}", id),
    }
    Ok(())
}

async fn list(store: &dyn TaskRecordStore, queue: &str, format: &str) -> CommandResult {
    let tasks = store.get_all(queue).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tasks)?),
        _ => print_table(&tasks),
    }
    Ok(())
}

async fn running(registry: &QueueRegistry, queue: &str) -> CommandResult {
    let mut tasks: Vec<Task> = registry.get_running_tasks(queue).await?.into_values().collect();
    if tasks.is_empty() {
        println!("No running tasks.");
        return Ok(());
    }
    tasks.sort_by(|a, b| a.started.cmp(&b.started));
    print_table(&tasks);
    Ok(())
}

async fn counts(store: &dyn TaskRecordStore, queue: &str) -> CommandResult {
    let counts = store.counts(queue).await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

fn print_table(tasks: &[Task]) {
    println!(
        "{:<38} {:>8} {:<11} {:<26} {}",
        "ID", "PRIORITY", "STATUS", "ADDED", "LOCK"
    );
    println!("{}", "-".repeat(120));
    for task in tasks {
        let status = if task.is_deleted() {
            format!("{}*", task.status)
        } else {
            task.status.to_string()
        };
        println!(
            "{:<38} {:>8} {:<11} {:<26} {}",
            task.id,
            task.priority,
            status,
            task.added.format("%Y-%m-%d %H:%M:%S%.3f"),
            task.lock_id.as_deref().unwrap_or("-")
        );
    }
}
