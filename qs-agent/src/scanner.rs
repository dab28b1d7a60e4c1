//! Discovery of date-partitioned log files.

use anyhow::{anyhow, bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A file that is new or has grown past its recorded offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub len: u64,
}

pub trait FileScanner: Send + Sync + 'static {
    /// Files under `dir` that are untracked or longer than their offset in `known_offsets`.
    ///
    /// `known_offsets` is keyed by path relative to `dir`.
    fn scan_changed_files(
        &self,
        dir: &Path,
        known_offsets: &HashMap<PathBuf, u64>,
    ) -> Result<Vec<ScannedFile>>;

    fn dir_for_date(&self, date: NaiveDate) -> PathBuf;

    fn date_from_dir(&self, dir: &Path) -> Result<NaiveDate>;

    /// The first partition directory dated after `dir`, if one exists.
    fn next_directory(&self, dir: &Path) -> Result<Option<PathBuf>>;

    /// Current wall-clock time in UTC.
    fn now(&self) -> NaiveDateTime;
}

/// Scans `root/<partition>` directories on the local filesystem.
///
/// Partition directories are named by formatting their date with `dir_format`
/// (for example `date=%Y-%m-%d`).
#[derive(Debug, Clone)]
pub struct LocalDirScanner {
    root: PathBuf,
    dir_format: String,
    file_suffix: Option<String>,
}

impl LocalDirScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        dir_format: impl Into<String>,
        file_suffix: Option<String>,
    ) -> Result<Self> {
        let dir_format = dir_format.into();
        validate_dir_format(&dir_format)?;
        Ok(Self {
            root: root.into(),
            dir_format,
            file_suffix: file_suffix.filter(|s| !s.is_empty()),
        })
    }

    fn wants(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        match &self.file_suffix {
            Some(suffix) => name.ends_with(suffix.as_str()),
            None => true,
        }
    }

    fn collect_files(&self, path: &Path, files: &mut Vec<(PathBuf, u64)>) -> Result<()> {
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry = entry?;
            let entry_path = entry.path();
            let metadata = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    // Files can disappear between listing and stat.
                    debug!(path = %entry_path.display(), error = %err, "metadata unavailable; skipping");
                    continue;
                }
            };
            if metadata.is_dir() {
                self.collect_files(&entry_path, files)?;
            } else if metadata.is_file() && self.wants(&entry_path) {
                files.push((entry_path, metadata.len()));
            }
        }
        Ok(())
    }
}

impl FileScanner for LocalDirScanner {
    fn scan_changed_files(
        &self,
        dir: &Path,
        known_offsets: &HashMap<PathBuf, u64>,
    ) -> Result<Vec<ScannedFile>> {
        if !dir.exists() {
            debug!(dir = %dir.display(), "partition directory does not exist yet");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        self.collect_files(dir, &mut files)?;

        let mut changed: Vec<ScannedFile> = files
            .into_iter()
            .filter(|(path, len)| {
                let known = path
                    .strip_prefix(dir)
                    .ok()
                    .and_then(|relative| known_offsets.get(relative));
                match known {
                    Some(offset) => *len > *offset,
                    None => true,
                }
            })
            .map(|(path, len)| ScannedFile { path, len })
            .collect();
        changed.sort_by(|a, b| a.path.cmp(&b.path));

        trace!(
            dir = %dir.display(),
            changed = changed.len(),
            known = known_offsets.len(),
            "scanned partition directory"
        );
        Ok(changed)
    }

    fn dir_for_date(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format(&self.dir_format).to_string())
    }

    fn date_from_dir(&self, dir: &Path) -> Result<NaiveDate> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("directory {} has no usable name", dir.display()))?;
        NaiveDate::parse_from_str(name, &self.dir_format).with_context(|| {
            format!(
                "directory {} does not match format {}",
                dir.display(),
                self.dir_format
            )
        })
    }

    fn next_directory(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let current = self.date_from_dir(dir)?;
        let mut next: Option<(NaiveDate, PathBuf)> = None;

        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read directory {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let Ok(date) = self.date_from_dir(&path) else {
                continue;
            };
            if date <= current {
                continue;
            }
            if next.as_ref().map_or(true, |(best, _)| date < *best) {
                next = Some((date, path));
            }
        }

        Ok(next.map(|(_, path)| path))
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// Rejects formats chrono cannot render, or that do not round-trip a date.
pub fn validate_dir_format(dir_format: &str) -> Result<()> {
    if dir_format.is_empty() {
        bail!("directory format cannot be empty");
    }
    if StrftimeItems::new(dir_format).any(|item| matches!(item, Item::Error)) {
        bail!("invalid directory format {dir_format}");
    }
    if dir_format.contains('/') {
        bail!("directory format {dir_format} must name a single directory");
    }
    let sample = NaiveDate::from_ymd_opt(2024, 2, 29).ok_or_else(|| anyhow!("invalid sample date"))?;
    let rendered = sample.format(dir_format).to_string();
    match NaiveDate::parse_from_str(&rendered, dir_format) {
        Ok(parsed) if parsed == sample => Ok(()),
        _ => bail!("directory format {dir_format} does not identify a calendar date"),
    }
}
