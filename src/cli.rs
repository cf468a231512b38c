//! CLI definitions for notequeue.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Notequeue CLI.
#[derive(Parser)]
#[command(name = "notequeue")]
#[command(about = "Inspect and feed the notequeue task store")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (defaults to ~/.notequeue/config.toml)
    #[arg(short, long, env = "NOTEQUEUE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configured store path
    #[arg(long, env = "NOTEQUEUE_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Enqueue a JSON payload
    Add {
        /// Target queue
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Forced priority (higher runs first)
        #[arg(short, long)]
        priority: Option<f64>,

        /// Payload as JSON
        payload: String,
    },

    /// Show one task
    Get {
        /// Task ID
        id: String,
    },

    /// List the tasks of a queue, oldest first
    List {
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// List the tasks currently claimed on a queue
    Running {
        #[arg(short, long, default_value = "default")]
        queue: String,
    },

    /// Per-status task counts of a queue
    Counts {
        #[arg(short, long, default_value = "default")]
        queue: String,
    },

    /// Cancel a task
    Delete {
        /// Task ID
        id: String,
    },

    /// Release every task claimed under a lock token
    Release {
        /// Lock token
        lock: String,
    },

    /// Release tasks that have been running too long
    Recover {
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Running time after which a task counts as abandoned
        #[arg(long, default_value_t = 300)]
        older_than: u64,
    },

    /// Cancel and purge every task of a queue
    Clear {
        #[arg(short, long)]
        queue: String,
    },

    /// List the queues that have stored tasks
    Queues,
}
