//! The ingestion pipeline: partition rotation, offset tracking and the two execution contexts.
//!
//! A single scheduler task runs every refresh tick serially, so scan state (current partition
//! directory, active and archived trackers, pending queue) has exactly one writer. Files it
//! schedules are handed to a bounded worker pool that runs one blocking task per file.
//!
//! ```text
//! tick ──► refresh_current ──► drain ──► refresh_old ──► drain
//!                                  │                        │
//!                                  └──────► worker pool ◄───┘
//!                                           (≤ max_parallelism files)
//! ```

mod refresh;
mod worker;

#[cfg(test)]
mod testing;

use crate::checkpoint::OffsetStore;
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::EventDispatcher;
use crate::error::{PipelineError, PipelineState};
use crate::metrics::PipelineMetrics;
use crate::reader::ReaderFactory;
use crate::scanner::FileScanner;
use crate::tracker::{CompletionPolicy, FileProgressTracker, IdleWindowPolicy};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use refresh::ScanState;
use worker::WorkerPool;

/// Minimum spacing between two refresh ticks, whatever triggered them.
pub const REFRESH_THROTTLE_MS: i64 = 2_000;

pub const DEFAULT_SCAN_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_AUTO_CLOSE_DELAY_HOURS: i64 = 4 * 24;
pub const DEFAULT_SYNC_WAIT_SECS: i64 = 120;
pub const DEFAULT_MAX_PARALLELISM: usize = 50;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub file_type: String,
    pub scan_delay: Duration,
    /// Archived files idle for longer than this are closed out and forgotten.
    pub auto_close_delay: chrono::Duration,
    /// Grace period after midnight during which yesterday's directory keeps being scanned.
    pub sync_wait: chrono::Duration,
    pub max_parallelism: usize,
    /// Earliest partition to start from when no offsets are persisted.
    pub floor_date: Option<NaiveDate>,
}

impl PipelineSettings {
    pub fn new(file_type: impl Into<String>) -> Self {
        Self {
            file_type: file_type.into(),
            scan_delay: DEFAULT_SCAN_DELAY,
            auto_close_delay: chrono::Duration::hours(DEFAULT_AUTO_CLOSE_DELAY_HOURS),
            sync_wait: chrono::Duration::seconds(DEFAULT_SYNC_WAIT_SECS),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            floor_date: None,
        }
    }
}

/// The pluggable pieces a pipeline is assembled from.
pub struct Collaborators<S, R, D, O> {
    pub scanner: S,
    pub readers: R,
    pub dispatcher: D,
    pub store: O,
    pub clock: Arc<dyn Clock>,
    pub completion: Arc<dyn CompletionPolicy>,
}

impl<S, R, D, O> Collaborators<S, R, D, O> {
    pub fn new(scanner: S, readers: R, dispatcher: D, store: O) -> Self {
        Self {
            scanner,
            readers,
            dispatcher,
            store,
            clock: Arc::new(SystemClock),
            completion: Arc::new(IdleWindowPolicy::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_completion_policy(mut self, completion: Arc<dyn CompletionPolicy>) -> Self {
        self.completion = completion;
        self
    }
}

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

fn decode_state(raw: u8) -> PipelineState {
    match raw {
        STATE_INIT => PipelineState::Init,
        STATE_RUNNING => PipelineState::Running,
        _ => PipelineState::Stopped,
    }
}

fn encode_state(state: PipelineState) -> u8 {
    match state {
        PipelineState::Init => STATE_INIT,
        PipelineState::Running => STATE_RUNNING,
        PipelineState::Stopped => STATE_STOPPED,
    }
}

/// State shared between the scheduler, the workers and the public handle.
pub(crate) struct Shared<S, R, D, O> {
    pub(crate) settings: PipelineSettings,
    pub(crate) scanner: S,
    pub(crate) readers: R,
    pub(crate) dispatcher: D,
    pub(crate) store: O,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) completion: Arc<dyn CompletionPolicy>,
    pub(crate) metrics: PipelineMetrics,
    state: AtomicU8,
    queue_len: AtomicUsize,
    active_len: AtomicUsize,
    archived_len: AtomicUsize,
    scan_dir: Mutex<Option<PathBuf>>,
}

impl<S, R, D, O> Shared<S, R, D, O> {
    pub(crate) fn new(settings: PipelineSettings, parts: Collaborators<S, R, D, O>) -> Self {
        let metrics = PipelineMetrics::for_file_type(&settings.file_type);
        Self {
            settings,
            scanner: parts.scanner,
            readers: parts.readers,
            dispatcher: parts.dispatcher,
            store: parts.store,
            clock: parts.clock,
            completion: parts.completion,
            metrics,
            state: AtomicU8::new(STATE_INIT),
            queue_len: AtomicUsize::new(0),
            active_len: AtomicUsize::new(0),
            archived_len: AtomicUsize::new(0),
            scan_dir: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    fn transition(
        &self,
        operation: &'static str,
        from: PipelineState,
        to: PipelineState,
    ) -> Result<(), PipelineError> {
        self.state
            .compare_exchange(
                encode_state(from),
                encode_state(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| PipelineError::InvalidState {
                operation,
                expected: from,
                actual: decode_state(actual),
            })
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: PipelineState,
    ) -> Result<(), PipelineError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                expected,
                actual,
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(encode_state(state), Ordering::Release);
    }

    pub(crate) fn queue_entered(&self) {
        let len = self.queue_len.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.queue_size.set(len as i64);
    }

    pub(crate) fn queue_left(&self) {
        let len = self
            .queue_len
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        self.metrics.queue_size.set(len as i64);
    }

    /// Mirrors scan state sizes into the atomics read by the public accessors and gauges.
    pub(crate) fn publish(&self, state: &ScanState) {
        self.active_len.store(state.active.len(), Ordering::Release);
        self.archived_len
            .store(state.archived.len(), Ordering::Release);
        self.metrics.archived_files.set(state.archived.len() as i64);
        *self.scan_dir.lock() = Some(state.scan_dir.clone());
    }
}

pub struct IngestionPipeline<S, R, D, O> {
    shared: Arc<Shared<S, R, D, O>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    force_tx: mpsc::UnboundedSender<()>,
    force_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl<S, R, D, O> IngestionPipeline<S, R, D, O>
where
    S: FileScanner,
    R: ReaderFactory,
    O: OffsetStore,
    D: EventDispatcher<O::Tx, Event = R::Event>,
{
    pub fn new(settings: PipelineSettings, parts: Collaborators<S, R, D, O>) -> Self {
        let (force_tx, force_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new(settings, parts)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            force_tx,
            force_rx: Mutex::new(Some(force_rx)),
            scheduler: Mutex::new(None),
        }
    }

    /// Loads persisted offsets and starts the scheduler. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.shared.expect_state("start", PipelineState::Init)?;
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let scan_state = refresh::load_offsets(&self.shared).map_err(PipelineError::LoadOffsets)?;
        self.shared
            .transition("start", PipelineState::Init, PipelineState::Running)?;
        self.shared.publish(&scan_state);

        let Some(force_rx) = self.force_rx.lock().take() else {
            // Only reachable if a previous start won the transition, which the CAS rules out.
            return Err(PipelineError::InvalidState {
                operation: "start",
                expected: PipelineState::Init,
                actual: self.shared.state(),
            });
        };

        let pool = WorkerPool::new(
            self.shared.clone(),
            self.shared.settings.max_parallelism,
            self.tasks.clone(),
            handle.clone(),
        );

        info!(
            file_type = %self.shared.settings.file_type,
            scan_dir = %scan_state.scan_dir.display(),
            active = scan_state.active.len(),
            archived = scan_state.archived.len(),
            max_parallelism = self.shared.settings.max_parallelism,
            "starting ingestion pipeline"
        );

        let scheduler = handle.spawn(run_scheduler(
            self.shared.clone(),
            scan_state,
            pool,
            self.cancel.clone(),
            force_rx,
        ));
        *self.scheduler.lock() = Some(scheduler);
        Ok(())
    }

    /// Stops new ticks and new submissions. Files already being read run to their next
    /// state check and flush their offsets.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        self.shared
            .transition("shut down", PipelineState::Running, PipelineState::Stopped)?;
        self.cancel.cancel();
        self.tasks.close();
        info!(file_type = %self.shared.settings.file_type, "ingestion pipeline shutting down");
        Ok(())
    }

    /// Waits for the scheduler and every worker task to finish.
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first.
    pub async fn await_termination(&self, timeout: Duration) -> Result<bool, PipelineError> {
        self.shared
            .expect_state("await termination", PipelineState::Stopped)?;

        let scheduler = self.scheduler.lock().take();
        let tasks = self.tasks.clone();
        let drained = async move {
            if let Some(scheduler) = scheduler {
                if let Err(err) = scheduler.await {
                    error!(error = %err, "scheduler task failed");
                }
            }
            tasks.wait().await;
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => {
                info!(file_type = %self.shared.settings.file_type, "ingestion pipeline terminated");
                Ok(true)
            }
            Err(_) => {
                warn!(
                    file_type = %self.shared.settings.file_type,
                    timeout_ms = timeout.as_millis() as u64,
                    in_flight = self.tasks.len(),
                    "timed out waiting for ingestion pipeline to terminate"
                );
                Ok(false)
            }
        }
    }

    /// Requests an out-of-band tick. Ignored unless the pipeline is running.
    pub fn force_refresh(&self) {
        if !self.shared.is_running() {
            debug!("ignoring refresh request; pipeline not running");
            return;
        }
        let _ = self.force_tx.send(());
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn file_type(&self) -> &str {
        &self.shared.settings.file_type
    }

    /// Files submitted to the worker pool and still waiting for a slot.
    pub fn queue_size(&self) -> usize {
        self.shared.queue_len.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active_len.load(Ordering::Acquire)
    }

    pub fn archived_count(&self) -> usize {
        self.shared.archived_len.load(Ordering::Acquire)
    }

    pub fn scan_dir(&self) -> Option<PathBuf> {
        self.shared.scan_dir.lock().clone()
    }

    pub fn store(&self) -> &O {
        &self.shared.store
    }
}

async fn run_scheduler<S, R, D, O>(
    shared: Arc<Shared<S, R, D, O>>,
    mut scan_state: ScanState,
    pool: WorkerPool<S, R, D, O>,
    cancel: CancellationToken,
    mut force_rx: mpsc::UnboundedReceiver<()>,
) where
    S: FileScanner,
    R: ReaderFactory,
    O: OffsetStore,
    D: EventDispatcher<O::Tx, Event = R::Event>,
{
    let mut ticker = interval(shared.settings.scan_delay.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            Some(()) = force_rx.recv() => {
                // Coalesce bursts of requests into one tick.
                while force_rx.try_recv().is_ok() {}
            }
        }

        let tick_shared = shared.clone();
        let tick_pool = pool.clone();
        let tick = tokio::task::spawn_blocking(move || {
            let mut submit = |tracker: Arc<FileProgressTracker>| tick_pool.submit(tracker);
            tick_shared.tick(&mut scan_state, &mut submit);
            scan_state
        });

        match tick.await {
            Ok(state) => scan_state = state,
            Err(err) => {
                error!(error = %err, "refresh task failed; scheduler stopping");
                return;
            }
        }
    }

    scan_state.release_pending();
    debug!(file_type = %shared.settings.file_type, "scheduler stopped");
}
