//! SQLite schema and row mapping.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::task::{Task, TaskStatus};

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    queue_id TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    added TEXT NOT NULL,
    started TEXT,
    status TEXT NOT NULL,
    lock_id TEXT,
    deleted_at TEXT,
    payload TEXT NOT NULL DEFAULT 'null'
);

CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(queue_id);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(queue_id, priority, added);
CREATE INDEX IF NOT EXISTS idx_tasks_lock ON tasks(lock_id);
CREATE INDEX IF NOT EXISTS idx_tasks_started ON tasks(started);
"#;

/// Columns selected by every task query, in `row_to_task` order.
pub const TASK_COLUMNS: &str =
    "id, queue_id, payload, priority, added, status, lock_id, started, deleted_at";

/// Fixed-width UTC timestamps so text order equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, text: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, text: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    text.map(|t| parse_ts(idx, &t)).transpose()
}

/// Map a row selected with [`TASK_COLUMNS`].
pub fn row_to_task(row: &Row<'_>) -> Result<Task, rusqlite::Error> {
    let payload_text: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let added: String = row.get(4)?;
    let status: String = row.get(5)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Task {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        payload,
        priority: row.get(3)?,
        added: parse_ts(4, &added)?,
        status,
        lock_id: row.get(6)?,
        started: parse_opt_ts(7, row.get(7)?)?,
        deleted_at: parse_opt_ts(8, row.get(8)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='tasks'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name='idx_tasks_lock'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_timestamp_text_orders_like_time() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::microseconds(1500);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(format_ts(&early).len(), format_ts(&late).len());
    }
}
