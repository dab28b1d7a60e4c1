use crate::pipeline::PipelineSettings;
use crate::scanner::validate_dir_format;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root_dir: String,
    #[serde(default = "default_dir_format")]
    pub dir_format: String,
    #[serde(default)]
    pub file_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub file_type: String,
    #[serde(default = "default_scan_delay_ms")]
    pub scan_delay_ms: u64,
    /// Archived files idle for longer than this are marked finished and dropped.
    #[serde(default = "default_auto_close_delay_ms")]
    pub auto_close_delay_ms: u64,
    /// Grace period after midnight before leaving yesterday's partition.
    #[serde(default = "default_sync_wait_ms")]
    pub sync_wait_ms: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// First partition to ingest when no offsets are persisted (DEFAULT: today minus
    /// `auto_close_delay_ms`).
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_idle_window_ms")]
    pub idle_window_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JournalConfig {
    #[serde(default = "default_final_marker")]
    pub final_marker: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_watcher_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

const DEFAULT_DIR_FORMAT: &str = "date=%Y-%m-%d";
const DEFAULT_SCAN_DELAY_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_AUTO_CLOSE_DELAY_MS: u64 = 4 * 24 * 60 * 60 * 1_000;
const DEFAULT_SYNC_WAIT_MS: u64 = 2 * 60 * 1_000;
const DEFAULT_MAX_PARALLELISM: usize = 50;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_IDLE_WINDOW_MS: u64 = 60 * 60 * 1_000;
const DEFAULT_WATCHER_ENABLED: bool = true;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

fn default_dir_format() -> String {
    DEFAULT_DIR_FORMAT.to_string()
}

fn default_scan_delay_ms() -> u64 {
    DEFAULT_SCAN_DELAY_MS
}

fn default_auto_close_delay_ms() -> u64 {
    DEFAULT_AUTO_CLOSE_DELAY_MS
}

fn default_sync_wait_ms() -> u64 {
    DEFAULT_SYNC_WAIT_MS
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_idle_window_ms() -> u64 {
    DEFAULT_IDLE_WINDOW_MS
}

fn default_final_marker() -> String {
    crate::dispatcher::DEFAULT_FINAL_MARKER.to_string()
}

fn default_watcher_enabled() -> bool {
    DEFAULT_WATCHER_ENABLED
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            idle_window_ms: DEFAULT_IDLE_WINDOW_MS,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            final_marker: default_final_marker(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_WATCHER_ENABLED,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.source.root_dir.trim().is_empty() {
            bail!("source.root_dir cannot be empty");
        }
        validate_dir_format(&self.source.dir_format).context("invalid source.dir_format")?;
        if self.pipeline.file_type.trim().is_empty() {
            bail!("pipeline.file_type cannot be empty");
        }
        if self.pipeline.max_parallelism == 0 {
            bail!("pipeline.max_parallelism must be at least 1");
        }
        if self.pipeline.scan_delay_ms == 0 {
            bail!("pipeline.scan_delay_ms must be positive");
        }
        if self.checkpoint.db_path.trim().is_empty() {
            bail!("checkpoint.db_path cannot be empty");
        }
        if self.journal.final_marker.is_empty() {
            bail!("journal.final_marker cannot be empty");
        }
        if let Some(addr) = &self.metrics.listen_addr {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid metrics.listen_addr {addr}"))?;
        }
        Ok(())
    }

    pub fn root_dir(&self) -> PathBuf {
        expand(&self.source.root_dir)
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        expand(&self.checkpoint.db_path)
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics
            .listen_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics.listen_addr {addr}"))
            })
            .transpose()
    }

    pub fn idle_window(&self) -> chrono::Duration {
        millis(self.completion.idle_window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.shutdown_timeout_ms)
    }

    pub fn watcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.poll_interval_ms)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let pipeline = &self.pipeline;
        let mut settings = PipelineSettings::new(pipeline.file_type.clone());
        settings.scan_delay = Duration::from_millis(pipeline.scan_delay_ms);
        settings.auto_close_delay = millis(pipeline.auto_close_delay_ms);
        settings.sync_wait = millis(pipeline.sync_wait_ms);
        settings.max_parallelism = pipeline.max_parallelism;
        settings.floor_date = pipeline.start_date;
        settings
    }
}

fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
