//! One refresh tick: scan, rotate, sweep the archive and feed the worker pool.
//!
//! Everything here runs on the scheduler and owns [`ScanState`] exclusively.

use super::{Shared, REFRESH_THROTTLE_MS};
use crate::checkpoint::{FileRecord, OffsetStore};
use crate::metrics::REFRESH_DURATION;
use crate::scanner::FileScanner;
use crate::tracker::FileProgressTracker;
use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Scheduler-owned view of which files are being tracked.
pub struct ScanState {
    pub(crate) scan_dir: PathBuf,
    /// Trackers under `scan_dir`, keyed by path relative to it.
    pub(crate) active: HashMap<PathBuf, Arc<FileProgressTracker>>,
    /// Trackers left behind by earlier rotations, oldest first.
    pub(crate) archived: Vec<Arc<FileProgressTracker>>,
    /// Claimed trackers not yet handed to the worker pool.
    pub(crate) pending: VecDeque<Arc<FileProgressTracker>>,
    pub(crate) last_refresh: Option<DateTime<Utc>>,
}

impl ScanState {
    fn new(scan_dir: PathBuf) -> Self {
        Self {
            scan_dir,
            active: HashMap::new(),
            archived: Vec::new(),
            pending: VecDeque::new(),
            last_refresh: None,
        }
    }

    /// Claims `tracker` and queues it. A tracker already claimed is left alone.
    fn offer(&mut self, tracker: &Arc<FileProgressTracker>) -> bool {
        if tracker.schedule() {
            self.pending.push_back(tracker.clone());
            true
        } else {
            false
        }
    }

    /// Drops every queued tracker, clearing the claims taken when they were queued.
    pub(crate) fn release_pending(&mut self) {
        for tracker in self.pending.drain(..) {
            tracker.done_running();
        }
    }
}

/// Builds the initial scan state from persisted offsets.
///
/// The newest persisted partition becomes the scan directory unless it predates the floor
/// date. Records of that partition become active; every other one is archived, finished or
/// not, and the first sweep retires the finished ones.
pub(crate) fn load_offsets<S, R, D, O>(shared: &Shared<S, R, D, O>) -> Result<ScanState>
where
    S: FileScanner,
    O: OffsetStore,
{
    let settings = &shared.settings;
    let records = shared
        .store
        .with_transaction(|tx| shared.store.list_by_type(tx, &settings.file_type))?;

    let floor = settings
        .floor_date
        .unwrap_or_else(|| (shared.clock.now() - settings.auto_close_delay).date_naive());
    let scan_date = match records.iter().map(|r| r.partition_date).max() {
        Some(latest) if latest >= floor => latest,
        _ => floor,
    };

    let mut state = ScanState::new(shared.scanner.dir_for_date(scan_date));
    for record in records {
        let is_current = record.partition_date == scan_date;
        let tracker = Arc::new(FileProgressTracker::new(record, shared.completion.clone()));
        if is_current {
            state.active.insert(tracker.file_path(), tracker);
        } else {
            state.archived.push(tracker);
        }
    }

    info!(
        file_type = %settings.file_type,
        scan_dir = %state.scan_dir.display(),
        active = state.active.len(),
        archived = state.archived.len(),
        "loaded persisted offsets"
    );
    Ok(state)
}

impl<S, R, D, O> Shared<S, R, D, O>
where
    S: FileScanner,
    O: OffsetStore,
{
    /// Runs one tick unless the previous one completed less than the throttle window ago.
    pub(crate) fn refresh(
        &self,
        state: &mut ScanState,
        submit: &mut dyn FnMut(Arc<FileProgressTracker>),
    ) {
        let now = self.clock.now();
        if let Some(last) = state.last_refresh {
            if (now - last).num_milliseconds() < REFRESH_THROTTLE_MS {
                trace!(file_type = %self.settings.file_type, "refresh throttled");
                return;
            }
        }

        let _timer = REFRESH_DURATION
            .with_label_values(&[self.settings.file_type.as_str()])
            .start_timer();

        if let Err(err) = self.refresh_current(state, now) {
            error!(
                file_type = %self.settings.file_type,
                scan_dir = %state.scan_dir.display(),
                error = %err,
                "failed to refresh current partition"
            );
        }
        self.drain_queue(state, submit);

        self.refresh_old(state, now);
        self.drain_queue(state, submit);

        self.publish(state);
        state.last_refresh = Some(self.clock.now());
    }

    /// Runs [`refresh`](Self::refresh), surviving a panic in any collaborator.
    ///
    /// A panicked tick releases whatever it had queued and still counts as completed.
    pub(crate) fn tick(
        &self,
        state: &mut ScanState,
        submit: &mut dyn FnMut(Arc<FileProgressTracker>),
    ) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.refresh(state, submit)));
        if let Err(payload) = outcome {
            error!(
                file_type = %self.settings.file_type,
                scan_dir = %state.scan_dir.display(),
                panic = panic_message(payload.as_ref()),
                "refresh tick panicked; scheduling continues"
            );
            state.release_pending();
            self.publish(state);
            state.last_refresh = Some(self.clock.now());
        }
    }

    fn refresh_current(&self, state: &mut ScanState, now: DateTime<Utc>) -> Result<()> {
        let mut changed = self.changed_files(state, now)?;
        while changed.is_empty() {
            let Some(next) = self.next_scan_dir(state)? else {
                break;
            };
            self.rotate(state, next);
            changed = self.changed_files(state, now)?;
        }

        let added = self.add_all(state, &changed, now);
        self.add_non_finished(state);
        added
    }

    /// Relative paths under the scan directory that have data left to read.
    fn changed_files(&self, state: &ScanState, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let known: HashMap<PathBuf, u64> = state
            .active
            .iter()
            .map(|(path, tracker)| (path.clone(), tracker.position()))
            .collect();
        let scanned = self.scanner.scan_changed_files(&state.scan_dir, &known)?;

        let mut changed = Vec::with_capacity(scanned.len());
        for file in scanned {
            let relative = match file.path.strip_prefix(&state.scan_dir) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => {
                    error!(
                        path = %file.path.display(),
                        scan_dir = %state.scan_dir.display(),
                        "scanned file lies outside the scan directory; skipping"
                    );
                    continue;
                }
            };
            if let Some(tracker) = state.active.get(&relative) {
                if tracker.is_finished(file.len, now) {
                    continue;
                }
            }
            changed.push(relative);
        }
        Ok(changed)
    }

    /// The partition to rotate to, if the day boundary allows moving on.
    fn next_scan_dir(&self, state: &ScanState) -> Result<Option<PathBuf>> {
        let now = self.scanner.now();
        let today = now.date();
        let since_midnight = Duration::seconds(i64::from(now.time().num_seconds_from_midnight()));

        if since_midnight < self.settings.sync_wait {
            let yesterday_dir = today
                .pred_opt()
                .map(|yesterday| self.scanner.dir_for_date(yesterday));
            if yesterday_dir.as_deref() == Some(state.scan_dir.as_path()) {
                debug!(
                    scan_dir = %state.scan_dir.display(),
                    "holding yesterday's partition until late writes settle"
                );
                return Ok(None);
            }
        }

        let Some(next) = self.scanner.next_directory(&state.scan_dir)? else {
            return Ok(None);
        };
        let next_date = self.scanner.date_from_dir(&next)?;
        if next_date > today {
            trace!(next = %next.display(), "next partition is dated in the future");
            return Ok(None);
        }

        let current_date = self.scanner.date_from_dir(&state.scan_dir)?;
        if next_date <= current_date {
            warn!(
                scan_dir = %state.scan_dir.display(),
                next = %next.display(),
                "scanner offered a partition that does not move forward; ignoring"
            );
            return Ok(None);
        }
        Ok(Some(next))
    }

    fn rotate(&self, state: &mut ScanState, next: PathBuf) {
        let mut moved: Vec<_> = state.active.drain().map(|(_, tracker)| tracker).collect();
        moved.sort_by_key(|tracker| tracker.file_path());
        let archived = moved.len();
        state.archived.extend(moved);

        let previous = std::mem::replace(&mut state.scan_dir, next);
        self.metrics.rotations.inc();
        info!(
            file_type = %self.settings.file_type,
            from = %previous.display(),
            to = %state.scan_dir.display(),
            archived,
            "rotated partition directory"
        );
    }

    /// Tracks any new paths and queues every changed file.
    fn add_all(&self, state: &mut ScanState, changed: &[PathBuf], now: DateTime<Utc>) -> Result<()> {
        let fresh: Vec<&PathBuf> = changed
            .iter()
            .filter(|path| !state.active.contains_key(*path))
            .collect();

        if !fresh.is_empty() {
            let date = self.scanner.date_from_dir(&state.scan_dir)?;
            let records = self.store.with_transaction(|tx| {
                fresh
                    .iter()
                    .map(|path| {
                        let record =
                            FileRecord::new(&self.settings.file_type, date, *path, now);
                        self.store.create(tx, record)
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            for record in records {
                debug!(
                    path = %record.file_path.display(),
                    date = %record.partition_date,
                    position = record.position,
                    "tracking new file"
                );
                self.metrics.files_created.inc();
                let tracker = Arc::new(FileProgressTracker::new(record, self.completion.clone()));
                state.active.insert(tracker.file_path(), tracker);
            }
        }

        for path in changed {
            if let Some(tracker) = state.active.get(path).cloned() {
                state.offer(&tracker);
            }
        }
        Ok(())
    }

    /// Re-offers every unfinished active file that no worker currently holds.
    fn add_non_finished(&self, state: &mut ScanState) {
        for tracker in state.active.values() {
            if !tracker.is_marked_finished() && tracker.schedule() {
                state.pending.push_back(tracker.clone());
            }
        }
    }

    /// Retires finished or expired archived files and re-offers the ones that may still grow.
    fn refresh_old(&self, state: &mut ScanState, now: DateTime<Utc>) {
        let min_time = now - self.settings.auto_close_delay;
        let archived = std::mem::take(&mut state.archived);
        let mut kept = Vec::with_capacity(archived.len());

        for tracker in archived {
            match tracker.remove_if_older(&self.store, min_time) {
                Ok(true) => {
                    self.metrics.files_retired.inc();
                    debug!(
                        path = %tracker.file_path().display(),
                        date = %tracker.partition_date(),
                        "retired archived file"
                    );
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        path = %tracker.file_path().display(),
                        date = %tracker.partition_date(),
                        error = %err,
                        "failed to retire archived file; keeping it"
                    );
                    kept.push(tracker);
                    continue;
                }
            }

            if tracker.should_refresh_old(now) {
                state.offer(&tracker);
            }
            kept.push(tracker);
        }

        state.archived = kept;
    }

    fn drain_queue(&self, state: &mut ScanState, submit: &mut dyn FnMut(Arc<FileProgressTracker>)) {
        if !self.is_running() {
            if !state.pending.is_empty() {
                debug!(dropped = state.pending.len(), "pipeline not running; releasing queued files");
            }
            state.release_pending();
            return;
        }
        while let Some(tracker) = state.pending.pop_front() {
            submit(tracker);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
