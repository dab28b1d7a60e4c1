//! Run-time progress of a single file.
//!
//! A [`FileProgressTracker`] wraps the persisted [`FileRecord`] with the bookkeeping the pipeline
//! needs while a file is live: the busy flag that keeps two workers off the same file, a retry
//! counter, and the completion predicates used by the scheduler.

use crate::checkpoint::{FileRecord, OffsetStore};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Decides when a file has stopped growing.
///
/// The offset comparison is done by the tracker; this only supplies the external completion
/// signal and the "might still be appended to" judgement for archived files.
pub trait CompletionPolicy: Send + Sync {
    /// Whether a file whose observed length equals its offset will never grow again.
    fn is_sealed(&self, record: &FileRecord, now: DateTime<Utc>) -> bool;

    /// Whether an unfinished file from an older partition may still receive data.
    fn may_still_grow(&self, record: &FileRecord, now: DateTime<Utc>) -> bool;
}

/// Treats a file as sealed once nothing has been read from it for `idle_window`.
#[derive(Debug, Clone, Copy)]
pub struct IdleWindowPolicy {
    idle_window: Duration,
}

impl IdleWindowPolicy {
    pub fn new(idle_window: Duration) -> Self {
        Self { idle_window }
    }
}

impl Default for IdleWindowPolicy {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl CompletionPolicy for IdleWindowPolicy {
    fn is_sealed(&self, record: &FileRecord, now: DateTime<Utc>) -> bool {
        now - record.last_event_time >= self.idle_window
    }

    fn may_still_grow(&self, record: &FileRecord, now: DateTime<Utc>) -> bool {
        now - record.last_event_time < self.idle_window
    }
}

pub struct FileProgressTracker {
    record: Mutex<FileRecord>,
    busy: AtomicBool,
    retry_count: AtomicU32,
    policy: Arc<dyn CompletionPolicy>,
}

impl std::fmt::Debug for FileProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileProgressTracker")
            .field("record", &*self.record.lock())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("retry_count", &self.retry_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileProgressTracker {
    pub fn new(record: FileRecord, policy: Arc<dyn CompletionPolicy>) -> Self {
        Self {
            record: Mutex::new(record),
            busy: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            policy,
        }
    }

    /// Claims the file for one worker. Returns `false` if it is already claimed.
    pub fn schedule(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the claim taken by [`schedule`](Self::schedule).
    pub fn done_running(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Snapshot of the wrapped record.
    pub fn record(&self) -> FileRecord {
        self.record.lock().clone()
    }

    pub fn position(&self) -> u64 {
        self.record.lock().position
    }

    pub fn file_path(&self) -> PathBuf {
        self.record.lock().file_path.clone()
    }

    pub fn partition_date(&self) -> NaiveDate {
        self.record.lock().partition_date
    }

    pub fn is_marked_finished(&self) -> bool {
        self.record.lock().finished
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Finished outright, or fully read and sealed by the completion policy.
    pub fn is_finished(&self, observed_len: u64, now: DateTime<Utc>) -> bool {
        let record = self.record.lock();
        record.finished
            || (observed_len == record.position && self.policy.is_sealed(&record, now))
    }

    pub fn should_refresh_old(&self, now: DateTime<Utc>) -> bool {
        let record = self.record.lock();
        !record.finished && self.policy.may_still_grow(&record, now)
    }

    /// Decides whether an archived file can be forgotten.
    ///
    /// Finished files are removed as is. Unfinished files whose last event predates
    /// `min_time` are closed out: marked finished and persisted before being dropped. A file
    /// currently held by a worker is never removed.
    pub fn remove_if_older<S: OffsetStore>(
        &self,
        store: &S,
        min_time: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if self.is_busy() {
            return Ok(false);
        }

        let expired = {
            let record = self.record.lock();
            if record.finished {
                return Ok(true);
            }
            if record.last_event_time >= min_time {
                return Ok(false);
            }
            let mut closed = record.clone();
            closed.finished = true;
            closed
        };

        store.with_transaction(|tx| store.update(tx, &expired))?;
        self.record.lock().finished = true;
        debug!(
            path = %expired.file_path.display(),
            date = %expired.partition_date,
            position = expired.position,
            "closed expired file"
        );
        Ok(true)
    }

    /// Applies the outcome of one dispatched event.
    pub fn update_entity(&self, is_final: bool, offset: u64, now: DateTime<Utc>) {
        let mut record = self.record.lock();
        if offset > record.position {
            record.position = offset;
        }
        if is_final {
            record.finished = true;
        }
        record.last_event_time = now;
        trace!(
            path = %record.file_path.display(),
            position = record.position,
            finished = record.finished,
            "tracker updated"
        );
    }

    /// Moves the offset past bytes that produced no event, leaving the event time alone.
    pub fn advance_position(&self, offset: u64) {
        let mut record = self.record.lock();
        if offset > record.position {
            record.position = offset;
        }
    }

    /// Flushes the current offset to the store.
    pub fn update_position<S: OffsetStore>(&self, store: &S) -> anyhow::Result<()> {
        let snapshot = self.record();
        store.with_transaction(|tx| store.update(tx, &snapshot))
    }

    pub fn processing_success(&self) {
        self.retry_count.store(0, Ordering::Relaxed);
    }

    pub fn processing_failed(&self, err: &anyhow::Error) {
        let retries = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            path = %self.file_path().display(),
            retries,
            error = %err,
            "event processing failed"
        );
    }
}

/// Clears a tracker's busy flag when dropped, whatever way the holder exits.
pub struct RunningGuard {
    tracker: Arc<FileProgressTracker>,
}

impl RunningGuard {
    /// Wraps a tracker whose busy flag the caller already holds.
    pub fn new(tracker: Arc<FileProgressTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<FileProgressTracker> {
        &self.tracker
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.tracker.done_running();
    }
}
