//! Queue and store configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use notequeue_config::{ConfigLoader, QueueSection, StoreSection};

/// Per-queue runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of claimed batches processed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Number of tasks claimed per lock token.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How long an idle dispatcher waits before polling the store again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Release running tasks whose lock is older than this (None = never).
    #[serde(default)]
    pub stale_after_secs: Option<u64>,

    /// Capacity of the per-queue event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_concurrency() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    1
}

fn default_poll_interval() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    256
}

impl QueueConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Stale-lock threshold as a duration, if enabled.
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
            stale_after_secs: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl From<&QueueSection> for QueueConfig {
    fn from(section: &QueueSection) -> Self {
        Self {
            concurrency: section.concurrency,
            batch_size: section.batch_size,
            poll_interval_ms: section.poll_interval_ms,
            stale_after_secs: section.stale_after_secs,
            event_capacity: section.event_capacity,
        }
    }
}

/// Task store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file (None = in-memory database).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// How long a writer waits for a competing transaction before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl From<&StoreSection> for StoreConfig {
    fn from(section: &StoreSection) -> Self {
        Self {
            db_path: Some(PathBuf::from(ConfigLoader::expand_path(&section.path))),
            busy_timeout_ms: section.busy_timeout_ms,
        }
    }
}
