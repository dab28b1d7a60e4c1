//! Turning decoded events into persisted records.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;

/// Outcome of dispatching one event.
#[derive(Debug)]
pub enum ProcessingStatus {
    Success,
    /// The event carried nothing to persist.
    Skip,
    /// The event was the last one the file will ever produce.
    Finish,
    Error(anyhow::Error),
}

impl ProcessingStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, ProcessingStatus::Error(_))
    }
}

/// Business logic for one event type.
///
/// `process` runs inside the transaction the offset store opened for this event; anything it
/// writes through `tx` commits or rolls back together with that event. Implementations must be
/// idempotent per `(path, offset)` because events after the last flushed offset are replayed
/// after a crash.
pub trait EventDispatcher<Tx>: Send + Sync + 'static {
    type Event;

    fn process(&self, tx: &Tx, event: &Self::Event, path: &Path, offset: u64) -> ProcessingStatus;
}

pub const DEFAULT_FINAL_MARKER: &str = "final";

/// Appends every JSON object event to the `query_events` table.
#[derive(Debug, Clone)]
pub struct JournalDispatcher {
    final_marker: String,
}

impl Default for JournalDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_FINAL_MARKER)
    }
}

impl JournalDispatcher {
    pub fn new(final_marker: impl Into<String>) -> Self {
        Self {
            final_marker: final_marker.into(),
        }
    }

    pub fn initialize_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS query_events (
                file_path TEXT NOT NULL,
                byte_offset INTEGER NOT NULL,
                query_id TEXT,
                payload TEXT NOT NULL,
                PRIMARY KEY (file_path, byte_offset)
            );
            CREATE INDEX IF NOT EXISTS idx_query_events_query_id ON query_events(query_id);
            ",
        )
        .context("failed to create query_events table")?;
        Ok(())
    }

    fn insert(&self, tx: &Connection, event: &Value, path: &Path, offset: u64) -> Result<()> {
        let query_id = event
            .get("query_id")
            .or_else(|| event.get("queryId"))
            .and_then(Value::as_str);
        let payload = serde_json::to_string(event).context("failed to encode event payload")?;
        tx.execute(
            "
            INSERT OR IGNORE INTO query_events (file_path, byte_offset, query_id, payload)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![path.to_string_lossy(), offset as i64, query_id, payload],
        )
        .with_context(|| format!("failed to journal event at {}:{offset}", path.display()))?;
        Ok(())
    }
}

impl EventDispatcher<Connection> for JournalDispatcher {
    type Event = Value;

    fn process(&self, tx: &Connection, event: &Value, path: &Path, offset: u64) -> ProcessingStatus {
        if !event.is_object() {
            return ProcessingStatus::Skip;
        }
        if let Err(err) = self.insert(tx, event, path, offset) {
            return ProcessingStatus::Error(err);
        }
        let is_final = event
            .get(&self.final_marker)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_final {
            ProcessingStatus::Finish
        } else {
            ProcessingStatus::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn journal() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        JournalDispatcher::initialize_schema(&conn).unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM query_events", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn journals_objects_once_per_offset() {
        let conn = journal();
        let dispatcher = JournalDispatcher::default();
        let path = Path::new("/data/date=2024-03-10/a.log");
        let event = json!({"query_id": "q-1", "state": "RUNNING"});

        assert!(matches!(
            dispatcher.process(&conn, &event, path, 0),
            ProcessingStatus::Success
        ));
        assert!(matches!(
            dispatcher.process(&conn, &event, path, 0),
            ProcessingStatus::Success
        ));
        assert_eq!(count(&conn), 1);

        let query_id: String = conn
            .query_row("SELECT query_id FROM query_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(query_id, "q-1");
    }

    #[test]
    fn non_objects_are_skipped() {
        let conn = journal();
        let dispatcher = JournalDispatcher::default();
        let status = dispatcher.process(&conn, &json!([1, 2]), Path::new("a.log"), 0);
        assert!(matches!(status, ProcessingStatus::Skip));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn final_marker_finishes_the_file() {
        let conn = journal();
        let dispatcher = JournalDispatcher::new("closed");
        let status = dispatcher.process(&conn, &json!({"closed": true}), Path::new("a.log"), 10);
        assert!(matches!(status, ProcessingStatus::Finish));
        let status = dispatcher.process(&conn, &json!({"final": true}), Path::new("a.log"), 20);
        assert!(matches!(status, ProcessingStatus::Success));
    }

    #[test]
    fn storage_failures_are_errors() {
        let conn = Connection::open_in_memory().unwrap();
        let status = JournalDispatcher::default().process(&conn, &json!({}), Path::new("a.log"), 0);
        assert!(status.is_error());
    }
}
