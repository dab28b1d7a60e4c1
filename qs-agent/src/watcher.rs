use anyhow::{Context, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) => path,
        }
    }
}

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

/// Watches `root` recursively and forwards file creations and modifications until cancelled.
///
/// Events are dropped rather than queued when the channel is full; the receiver only uses them
/// as a hint that a refresh is worthwhile.
pub async fn watch_root(
    root: PathBuf,
    poll_interval: Duration,
    event_tx: mpsc::Sender<FileEvent>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let watcher_tx = event_tx.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => handle_event(&watcher_tx, event),
            Err(err) => error!(error = %err, "file watcher error"),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )
    .context("failed to create notify watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch path {}", root.display()))?;

    info!(root = %root.display(), "file watcher started");

    // The watcher stops delivering events once dropped.
    cancel_token.cancelled().await;
    drop(watcher);
    debug!(root = %root.display(), "file watcher stopped");
    Ok(())
}

fn handle_event(event_tx: &mpsc::Sender<FileEvent>, event: Event) {
    let make: fn(PathBuf) -> FileEvent = match event.kind {
        EventKind::Create(_) => FileEvent::Created,
        EventKind::Modify(_) => FileEvent::Modified,
        _ => return,
    };
    for path in event.paths {
        if path.is_dir() {
            continue;
        }
        trace!(path = %path.display(), kind = ?event.kind, "detected file change");
        send_event(event_tx, make(path));
    }
}

fn send_event(event_tx: &mpsc::Sender<FileEvent>, event: FileEvent) {
    match event_tx.try_send(event) {
        Ok(_) => {}
        Err(TrySendError::Full(event)) => {
            trace!(path = %event.path().display(), "watcher channel full; dropping file event");
        }
        Err(TrySendError::Closed(event)) => {
            debug!(path = %event.path().display(), "watcher channel closed; dropping file event");
        }
    }
}
