//! In-memory stand-ins used by the pipeline unit tests.

use super::{Collaborators, IngestionPipeline, PipelineSettings, Shared};
use crate::checkpoint::{FileRecord, OffsetStore, SqliteOffsetStore};
use crate::clock::ManualClock;
use crate::dispatcher::JournalDispatcher;
use crate::reader::JsonLinesReaderFactory;
use crate::scanner::{FileScanner, ScannedFile};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ROOT: &str = "/fake";

pub(crate) type TestShared =
    Shared<FakeScanner, JsonLinesReaderFactory, JournalDispatcher, SqliteOffsetStore>;

pub(crate) fn day(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

pub(crate) fn dt(d: u32, hour: u32, minute: u32) -> NaiveDateTime {
    day(d).and_hms_opt(hour, minute, 0).unwrap()
}

pub(crate) fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    naive.and_utc()
}

#[derive(Default)]
struct FakeFs {
    dirs: BTreeMap<NaiveDate, BTreeMap<PathBuf, u64>>,
    now: NaiveDateTime,
    fail_scans: bool,
    panic_scans: u32,
}

/// A partition tree that lives in memory. Clones share the same tree.
#[derive(Clone, Default)]
pub(crate) struct FakeScanner {
    inner: Arc<Mutex<FakeFs>>,
}

impl FakeScanner {
    pub(crate) fn new(now: NaiveDateTime) -> Self {
        let scanner = Self::default();
        scanner.inner.lock().now = now;
        scanner
    }

    pub(crate) fn set_now(&self, now: NaiveDateTime) {
        self.inner.lock().now = now;
    }

    pub(crate) fn mkdir(&self, date: NaiveDate) {
        self.inner.lock().dirs.entry(date).or_default();
    }

    /// Creates or resizes a file inside a partition.
    pub(crate) fn write(&self, date: NaiveDate, relative: &str, len: u64) {
        self.inner
            .lock()
            .dirs
            .entry(date)
            .or_default()
            .insert(PathBuf::from(relative), len);
    }

    pub(crate) fn fail_scans(&self, fail: bool) {
        self.inner.lock().fail_scans = fail;
    }

    /// Makes the next `count` scans panic.
    pub(crate) fn panic_next_scans(&self, count: u32) {
        self.inner.lock().panic_scans = count;
    }
}

impl FileScanner for FakeScanner {
    fn scan_changed_files(
        &self,
        dir: &Path,
        known_offsets: &HashMap<PathBuf, u64>,
    ) -> Result<Vec<ScannedFile>> {
        let date = self.date_from_dir(dir)?;
        let mut fs = self.inner.lock();
        if fs.panic_scans > 0 {
            fs.panic_scans -= 1;
            drop(fs);
            panic!("scan of {} blew up", dir.display());
        }
        if fs.fail_scans {
            bail!("scan of {} failed", dir.display());
        }
        let Some(files) = fs.dirs.get(&date) else {
            return Ok(Vec::new());
        };
        Ok(files
            .iter()
            .filter(|(path, len)| known_offsets.get(*path).map_or(true, |offset| *len > offset))
            .map(|(path, len)| ScannedFile {
                path: dir.join(path),
                len: *len,
            })
            .collect())
    }

    fn dir_for_date(&self, date: NaiveDate) -> PathBuf {
        Path::new(ROOT).join(format!("date={}", date.format("%Y-%m-%d")))
    }

    fn date_from_dir(&self, dir: &Path) -> Result<NaiveDate> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("date="))
            .ok_or_else(|| anyhow!("not a partition directory: {}", dir.display()))?;
        Ok(NaiveDate::parse_from_str(name, "%Y-%m-%d")?)
    }

    fn next_directory(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let current = self.date_from_dir(dir)?;
        let next = self
            .inner
            .lock()
            .dirs
            .range((Bound::Excluded(current), Bound::Unbounded))
            .next()
            .map(|(date, _)| *date);
        Ok(next.map(|date| self.dir_for_date(date)))
    }

    fn now(&self) -> NaiveDateTime {
        self.inner.lock().now
    }
}

pub(crate) type TestPipeline =
    IngestionPipeline<FakeScanner, JsonLinesReaderFactory, JournalDispatcher, SqliteOffsetStore>;

pub(crate) type TestParts =
    Collaborators<FakeScanner, JsonLinesReaderFactory, JournalDispatcher, SqliteOffsetStore>;

pub(crate) fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::new("impala");
    settings.floor_date = Some(day(10));
    settings
}

/// Collaborators over the fake tree, an in-memory store and a manual clock.
pub(crate) fn collaborators(scanner: &FakeScanner, clock: &Arc<ManualClock>) -> TestParts {
    Collaborators::new(
        scanner.clone(),
        JsonLinesReaderFactory,
        JournalDispatcher::default(),
        SqliteOffsetStore::open_in_memory().unwrap(),
    )
    .with_clock(clock.clone())
}

pub(crate) fn shared(scanner: &FakeScanner, clock: &Arc<ManualClock>) -> TestShared {
    Shared::new(settings(), collaborators(scanner, clock))
}

pub(crate) fn stored(shared: &TestShared) -> Vec<FileRecord> {
    shared
        .store
        .with_transaction(|tx| shared.store.list_by_type(tx, "impala"))
        .unwrap()
}

pub(crate) fn persist(shared: &TestShared, record: FileRecord) -> FileRecord {
    shared
        .store
        .with_transaction(|tx| shared.store.create(tx, record))
        .unwrap()
}
