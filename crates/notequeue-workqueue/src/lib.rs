//! # Notequeue Work Queue
//!
//! Durable, priority-ordered task queue for a local-first note app.
//!
//! ## Features
//!
//! - Task record store with soft deletes (SQLite and in-memory)
//! - Atomic batch claims ordered by priority, then insertion
//! - Worker pool per named queue with pause/resume and statistics
//! - All-or-nothing batch execution on disposable queues
//! - Opt-in recovery of tasks abandoned mid-flight
//! - Queue-backed sync plan execution

pub mod adapter;
pub mod batch;
pub mod config;
pub mod error;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod stats;
pub mod store;
pub mod sync_plan;
pub mod task;

pub use adapter::StoreAdapter;
pub use batch::BatchOptions;
pub use config::{QueueConfig, StoreConfig};
pub use error::QueueError;
pub use pool::{QueueEvent, TaskInput, TaskProcessor, WorkerPool, processor_fn};
pub use recovery::StaleTaskPolicy;
pub use registry::{DEFAULT_QUEUE, QueueOptions, QueueRegistry};
pub use stats::QueueStats;
pub use store::{MemoryTaskStore, SqliteTaskStore, StatusCounts, TaskRecordStore};
pub use sync_plan::{SYNC_QUEUE, SyncExecutor, SyncOperation, SyncQueue};
pub use task::{LockToken, Task, TaskOptions, TaskStatus};
