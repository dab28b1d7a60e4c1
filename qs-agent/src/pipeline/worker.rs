//! Bounded pool of per-file read tasks.

use super::Shared;
use crate::checkpoint::OffsetStore;
use crate::dispatcher::{EventDispatcher, ProcessingStatus};
use crate::reader::{EventReader, ReaderFactory};
use crate::scanner::FileScanner;
use crate::tracker::{FileProgressTracker, RunningGuard};
use anyhow::Result;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub(crate) struct WorkerPool<S, R, D, O> {
    shared: Arc<Shared<S, R, D, O>>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    handle: Handle,
}

impl<S, R, D, O> Clone for WorkerPool<S, R, D, O> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            permits: self.permits.clone(),
            tasks: self.tasks.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<S, R, D, O> WorkerPool<S, R, D, O>
where
    S: FileScanner,
    R: ReaderFactory,
    O: OffsetStore,
    D: EventDispatcher<O::Tx, Event = R::Event>,
{
    pub(crate) fn new(
        shared: Arc<Shared<S, R, D, O>>,
        max_parallelism: usize,
        tasks: TaskTracker,
        handle: Handle,
    ) -> Self {
        Self {
            shared,
            permits: Arc::new(Semaphore::new(max_parallelism.max(1))),
            tasks,
            handle,
        }
    }

    /// Runs `tracker` once a slot frees up. The caller must already hold its busy flag; it is
    /// released when the task ends, however it ends.
    pub(crate) fn submit(&self, tracker: Arc<FileProgressTracker>) {
        let guard = RunningGuard::new(tracker);
        let shared = self.shared.clone();
        let permits = self.permits.clone();
        shared.queue_entered();

        self.tasks.spawn_on(
            async move {
                let permit = permits.acquire_owned().await;
                shared.queue_left();
                let Ok(_permit) = permit else {
                    warn!(
                        path = %guard.tracker().file_path().display(),
                        "worker pool closed; dropping file"
                    );
                    return;
                };

                let path = guard.tracker().file_path();
                let worker_shared = shared.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    process_file(&worker_shared, guard.tracker());
                })
                .await;
                if let Err(err) = outcome {
                    error!(path = %path.display(), error = %err, "file task panicked");
                }
            },
            &self.handle,
        );
    }
}

/// Reads one file from its tracked offset, dispatching every event in its own transaction.
///
/// Stops at end of data or as soon as the pipeline leaves the running state. The reached
/// offset is flushed on every exit path.
pub(crate) fn process_file<S, R, D, O>(shared: &Shared<S, R, D, O>, tracker: &FileProgressTracker)
where
    S: FileScanner,
    R: ReaderFactory,
    O: OffsetStore,
    D: EventDispatcher<O::Tx, Event = R::Event>,
{
    if !shared.is_running() {
        return;
    }

    let record = tracker.record();
    let path = shared
        .scanner
        .dir_for_date(record.partition_date)
        .join(&record.file_path);

    let mut reader = match shared.readers.open(&path, record.position) {
        Ok(Some(reader)) => reader,
        Ok(None) => return,
        Err(err) => {
            tracker.processing_failed(&err);
            error!(
                path = %path.display(),
                retries = tracker.retry_count(),
                error = %err,
                "failed to open file"
            );
            return;
        }
    };

    let mut processed = 0u64;
    let mut failed = 0u64;
    let outcome: Result<()> = loop {
        if !shared.is_running() {
            debug!(path = %path.display(), "pipeline stopping; leaving file early");
            break Ok(());
        }

        let event = match reader.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        let offset = reader.last_offset();

        let result = shared.store.with_transaction(|tx| {
            match shared.dispatcher.process(tx, &event, &path, offset) {
                ProcessingStatus::Error(err) => Err(err),
                status => Ok(status),
            }
        });

        let now = shared.clock.now();
        let next_offset = reader.current_offset();
        match result {
            Ok(status) => {
                let is_final = matches!(status, ProcessingStatus::Finish);
                tracker.update_entity(is_final, next_offset, now);
                tracker.processing_success();
                shared.metrics.events_processed.inc();
                processed += 1;
                if is_final {
                    debug!(path = %path.display(), offset, "file reported its final event");
                }
            }
            Err(err) => {
                tracker.update_entity(false, next_offset, now);
                tracker.processing_failed(&err);
                shared.metrics.events_failed.inc();
                failed += 1;
                warn!(
                    path = %path.display(),
                    offset,
                    retries = tracker.retry_count(),
                    error = %err,
                    "failed to process event"
                );
            }
        }
    };

    tracker.advance_position(reader.current_offset());
    drop(reader);

    if let Err(err) = outcome {
        tracker.processing_failed(&err);
        error!(
            path = %path.display(),
            retries = tracker.retry_count(),
            position = tracker.position(),
            error = %err,
            "failed to read file"
        );
    }

    if let Err(err) = tracker.update_position(&shared.store) {
        error!(path = %path.display(), error = %err, "failed to flush file offset");
    }

    if processed > 0 || failed > 0 {
        debug!(
            path = %path.display(),
            processed,
            failed,
            position = tracker.position(),
            finished = tracker.is_marked_finished(),
            "file pass complete"
        );
    }
}
