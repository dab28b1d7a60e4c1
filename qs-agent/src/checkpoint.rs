//! Durable per-file ingestion offsets.
//!
//! Every read or write goes through [`OffsetStore::with_transaction`]; the pipeline never relies
//! on implicit atomicity across separate calls. The SQLite store is the one shipped with the
//! agent, and its connection doubles as the transaction handle handed to event dispatchers so a
//! dispatched record and its bookkeeping commit together.

use crate::metrics::CHECKPOINT_DURATION;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persisted progress of one file under one partition directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: Option<i64>,
    pub file_type: String,
    pub partition_date: NaiveDate,
    /// Path relative to the partition directory.
    pub file_path: PathBuf,
    pub finished: bool,
    pub position: u64,
    pub last_event_time: DateTime<Utc>,
}

impl FileRecord {
    /// A record for a file seen for the first time: offset 0, unfinished.
    pub fn new(
        file_type: impl Into<String>,
        partition_date: NaiveDate,
        file_path: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            file_type: file_type.into(),
            partition_date,
            file_path: file_path.into(),
            finished: false,
            position: 0,
            last_event_time: now,
        }
    }
}

pub trait OffsetStore: Send + Sync + 'static {
    /// Handle through which a single transaction's statements are issued.
    type Tx;

    /// Runs `f` inside one transaction, committing on `Ok` and rolling back on `Err`.
    fn with_transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Self::Tx) -> Result<R>;

    fn list_by_type(&self, tx: &Self::Tx, file_type: &str) -> Result<Vec<FileRecord>>;

    /// Persists a new record and returns the stored row. If a row already exists for the same
    /// file the existing row is returned unchanged.
    fn create(&self, tx: &Self::Tx, record: FileRecord) -> Result<FileRecord>;

    /// Writes position, finished flag and last event time. Stored positions never move
    /// backwards and a finished row is never reopened.
    fn update(&self, tx: &Self::Tx, record: &FileRecord) -> Result<()>;
}

#[derive(Debug)]
pub struct SqliteOffsetStore {
    conn: Mutex<Connection>,
}

impl SqliteOffsetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create checkpoint directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open checkpoint db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL mode for checkpoint db")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set checkpoint db synchronous mode")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set checkpoint db busy timeout")?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory checkpoint db")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl OffsetStore for SqliteOffsetStore {
    type Tx = Connection;

    fn with_transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin checkpoint transaction")?;
        // Dropping `tx` on the error path rolls it back.
        let conn: &Connection = &tx;
        let out = f(conn)?;
        tx.commit().context("failed to commit checkpoint transaction")?;
        Ok(out)
    }

    fn list_by_type(&self, tx: &Connection, file_type: &str) -> Result<Vec<FileRecord>> {
        let _timer = CHECKPOINT_DURATION
            .with_label_values(&["list"])
            .start_timer();
        let mut stmt = tx
            .prepare(
                "
                SELECT id, file_type, partition_date, file_path, finished, position, last_event_time
                FROM file_status
                WHERE file_type = ?1
                ORDER BY partition_date, file_path
                ",
            )
            .context("failed to prepare file status select statement")?;

        let rows = stmt
            .query_map(params![file_type], row_to_record)
            .context("failed to query file status table")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to decode file status row")?);
        }
        Ok(records)
    }

    fn create(&self, tx: &Connection, record: FileRecord) -> Result<FileRecord> {
        let _timer = CHECKPOINT_DURATION
            .with_label_values(&["create"])
            .start_timer();
        let file_path = normalize_path(&record.file_path);
        tx.execute(
            "
            INSERT INTO file_status (
                file_type,
                partition_date,
                file_path,
                finished,
                position,
                last_event_time
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(file_type, partition_date, file_path) DO NOTHING
            ",
            params![
                record.file_type,
                record.partition_date,
                file_path,
                record.finished,
                record.position as i64,
                record.last_event_time.timestamp_millis(),
            ],
        )
        .context("failed to insert file status record")?;

        tx.query_row(
            "
            SELECT id, file_type, partition_date, file_path, finished, position, last_event_time
            FROM file_status
            WHERE file_type = ?1 AND partition_date = ?2 AND file_path = ?3
            ",
            params![record.file_type, record.partition_date, file_path],
            row_to_record,
        )
        .context("failed to read back file status record")
    }

    fn update(&self, tx: &Connection, record: &FileRecord) -> Result<()> {
        let _timer = CHECKPOINT_DURATION
            .with_label_values(&["update"])
            .start_timer();
        let changed = match record.id {
            Some(id) => tx.execute(
                "
                UPDATE file_status SET
                    position = MAX(position, ?1),
                    finished = MAX(finished, ?2),
                    last_event_time = MAX(last_event_time, ?3)
                WHERE id = ?4
                ",
                params![
                    record.position as i64,
                    record.finished,
                    record.last_event_time.timestamp_millis(),
                    id
                ],
            ),
            None => tx.execute(
                "
                UPDATE file_status SET
                    position = MAX(position, ?1),
                    finished = MAX(finished, ?2),
                    last_event_time = MAX(last_event_time, ?3)
                WHERE file_type = ?4 AND partition_date = ?5 AND file_path = ?6
                ",
                params![
                    record.position as i64,
                    record.finished,
                    record.last_event_time.timestamp_millis(),
                    record.file_type,
                    record.partition_date,
                    normalize_path(&record.file_path)
                ],
            ),
        }
        .context("failed to update file status record")?;

        if changed == 0 {
            bail!(
                "no file status row for {} ({})",
                record.file_path.display(),
                record.partition_date
            );
        }
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let file_path: String = row.get(3)?;
    let last_event_ms: i64 = row.get(6)?;
    Ok(FileRecord {
        id: Some(row.get(0)?),
        file_type: row.get(1)?,
        partition_date: row.get(2)?,
        file_path: PathBuf::from(file_path),
        finished: row.get(4)?,
        position: row.get::<_, i64>(5)? as u64,
        last_event_time: DateTime::from_timestamp_millis(last_event_ms).unwrap_or_default(),
    })
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS file_status (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_type TEXT NOT NULL,
            partition_date TEXT NOT NULL,
            file_path TEXT NOT NULL,
            finished INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0,
            last_event_time INTEGER NOT NULL,
            UNIQUE (file_type, partition_date, file_path)
        );
        ",
    )
    .context("failed to create file_status table")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).expect("valid date")
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap()
    }

    #[test]
    fn create_assigns_id_and_is_idempotent() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let first = store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "a.log", at(1)))
            })
            .unwrap();
        assert!(first.id.is_some());
        assert_eq!(first.position, 0);
        assert!(!first.finished);

        let second = store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "a.log", at(5)))
            })
            .unwrap();
        assert_eq!(first, second);

        let all = store
            .with_transaction(|tx| store.list_by_type(tx, "impala"))
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn list_filters_by_type() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "a.log", at(1)))?;
                store.create(tx, FileRecord::new("impala", date(11), "b.log", at(1)))?;
                store.create(tx, FileRecord::new("hive", date(11), "c.log", at(1)))?;
                Ok(())
            })
            .unwrap();

        let impala = store
            .with_transaction(|tx| store.list_by_type(tx, "impala"))
            .unwrap();
        let paths: Vec<_> = impala.iter().map(|r| r.file_path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("a.log"), PathBuf::from("b.log")]);
    }

    #[test]
    fn update_never_moves_backwards() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let mut record = store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "a.log", at(1)))
            })
            .unwrap();

        record.position = 100;
        record.finished = true;
        record.last_event_time = at(3);
        store
            .with_transaction(|tx| store.update(tx, &record))
            .unwrap();

        record.position = 40;
        record.finished = false;
        record.last_event_time = at(2);
        store
            .with_transaction(|tx| store.update(tx, &record))
            .unwrap();

        let stored = store
            .with_transaction(|tx| store.list_by_type(tx, "impala"))
            .unwrap()
            .remove(0);
        assert_eq!(stored.position, 100);
        assert!(stored.finished);
        assert_eq!(stored.last_event_time, at(3));
    }

    #[test]
    fn update_without_id_matches_natural_key() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "nested/a.log", at(1)))
            })
            .unwrap();

        let mut detached = FileRecord::new("impala", date(10), "nested/a.log", at(2));
        detached.position = 7;
        store
            .with_transaction(|tx| store.update(tx, &detached))
            .unwrap();

        let stored = store
            .with_transaction(|tx| store.list_by_type(tx, "impala"))
            .unwrap()
            .remove(0);
        assert_eq!(stored.position, 7);
    }

    #[test]
    fn update_of_unknown_row_fails() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let missing = FileRecord::new("impala", date(10), "ghost.log", at(1));
        let err = store
            .with_transaction(|tx| store.update(tx, &missing))
            .unwrap_err();
        assert!(err.to_string().contains("no file status row"));
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let result: Result<()> = store.with_transaction(|tx| {
            store.create(tx, FileRecord::new("impala", date(10), "a.log", at(1)))?;
            bail!("dispatcher blew up")
        });
        assert!(result.is_err());

        let all = store
            .with_transaction(|tx| store.list_by_type(tx, "impala"))
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.db");
        let store = SqliteOffsetStore::open(&path).unwrap();
        store
            .with_transaction(|tx| {
                store.create(tx, FileRecord::new("impala", date(10), "a.log", at(1)))
            })
            .unwrap();
        assert!(path.exists());

        drop(store);
        let reopened = SqliteOffsetStore::open(&path).unwrap();
        let all = reopened
            .with_transaction(|tx| reopened.list_by_type(tx, "impala"))
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
