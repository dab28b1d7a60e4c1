//! Application runner for the qs-agent.
//!
//! Wires the shipped collaborators (local partition scanner, JSON-lines reader, SQLite offset
//! store and journal) into one pipeline and drives it until shutdown.

use crate::checkpoint::{OffsetStore, SqliteOffsetStore};
use crate::config::Config;
use crate::dispatcher::JournalDispatcher;
use crate::pipeline::{Collaborators, IngestionPipeline};
use crate::reader::JsonLinesReaderFactory;
use crate::scanner::LocalDirScanner;
use crate::tracker::IdleWindowPolicy;
use crate::watcher::{watch_root, FileEvent, WATCHER_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type AgentPipeline =
    IngestionPipeline<LocalDirScanner, JsonLinesReaderFactory, JournalDispatcher, SqliteOffsetStore>;

/// Builds the pipeline described by `config`. The pipeline is returned unstarted.
pub fn build_pipeline(config: &Config) -> Result<AgentPipeline> {
    let db_path = config.checkpoint_db_path();
    let store = SqliteOffsetStore::open(&db_path)?;
    store
        .with_transaction(|tx| JournalDispatcher::initialize_schema(tx))
        .context("failed to prepare query journal")?;

    let scanner = LocalDirScanner::new(
        config.root_dir(),
        config.source.dir_format.clone(),
        config.source.file_suffix.clone(),
    )?;
    let dispatcher = JournalDispatcher::new(config.journal.final_marker.clone());

    let parts = Collaborators::new(scanner, JsonLinesReaderFactory, dispatcher, store)
        .with_completion_policy(Arc::new(IdleWindowPolicy::new(config.idle_window())));

    info!(
        root_dir = %config.root_dir().display(),
        checkpoint_db = %db_path.display(),
        file_type = %config.pipeline.file_type,
        "configured ingestion pipeline"
    );
    Ok(IngestionPipeline::new(config.pipeline_settings(), parts))
}

/// Runs the agent until Ctrl-C.
pub async fn run(config: &Config) -> Result<()> {
    info!("qs-agent starting");
    let pipeline = build_pipeline(config)?;
    pipeline.start()?;
    drive(&pipeline, config, shutdown_signal()).await
}

/// Feeds watcher hints into a started pipeline until `shutdown` resolves, then stops it.
pub async fn drive<F>(pipeline: &AgentPipeline, config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let cancel_token = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel::<FileEvent>(WATCHER_CHANNEL_CAPACITY);

    let root = config.root_dir();
    let watcher_handle = if !config.watcher.enabled {
        None
    } else if !root.is_dir() {
        warn!(root = %root.display(), "root directory missing; file watcher disabled");
        None
    } else {
        let poll_interval = config.watcher_poll_interval();
        let cancel_token = cancel_token.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = watch_root(root, poll_interval, event_tx, cancel_token).await {
                error!(error = %err, "file watcher exited unexpectedly");
            }
        }))
    };

    info!(file_type = %pipeline.file_type(), "qs-agent started");

    tokio::pin!(shutdown);
    let mut watching = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            maybe_event = event_rx.recv(), if watching => match maybe_event {
                Some(event) => {
                    debug!(path = %event.path().display(), "file change detected; requesting refresh");
                    pipeline.force_refresh();
                }
                // Watcher gone; the periodic schedule carries on alone.
                None => watching = false,
            },
        }
    }

    cancel_token.cancel();
    if let Some(handle) = watcher_handle {
        if let Err(err) = handle.await {
            warn!(error = %err, "file watcher task failed");
        }
    }

    pipeline.shutdown()?;
    let timeout = config.shutdown_timeout();
    if pipeline.await_termination(timeout).await? {
        info!("qs-agent stopped cleanly");
    } else {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "qs-agent stopped with work still in flight"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed while waiting for shutdown signal");
    }
}
