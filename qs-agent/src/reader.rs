//! Event readers: open one file at a byte offset and pull decoded events from it.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LINE_PREVIEW_CHARS: usize = 120;

/// A finite, non-restartable cursor over the events of one file.
///
/// The underlying handle is released when the reader is dropped.
pub trait EventReader {
    type Event;

    /// The next decoded event, or `None` once no complete event is available.
    fn next_event(&mut self) -> Result<Option<Self::Event>>;

    /// Byte offset at which the most recently returned event starts.
    fn last_offset(&self) -> u64;

    /// Byte offset just past everything consumed so far.
    fn current_offset(&self) -> u64;
}

pub trait ReaderFactory: Send + Sync + 'static {
    type Event: Send;
    type Reader: EventReader<Event = Self::Event>;

    /// Opens `path` positioned at `offset`. `None` means there is nothing to read.
    fn open(&self, path: &Path, offset: u64) -> Result<Option<Self::Reader>>;
}

/// Reads newline-delimited JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesReaderFactory;

impl ReaderFactory for JsonLinesReaderFactory {
    type Event = Value;
    type Reader = JsonLinesReader;

    fn open(&self, path: &Path, offset: u64) -> Result<Option<JsonLinesReader>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "file vanished before it could be opened");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", path.display()))
            }
        };

        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if len < offset {
            warn!(
                path = %path.display(),
                offset,
                current_size = len,
                "file is shorter than its recorded offset; skipping"
            );
            return Ok(None);
        }

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek {} to {offset}", path.display()))?;

        Ok(Some(JsonLinesReader {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: Vec::new(),
            last_offset: offset,
            offset,
            exhausted: false,
        }))
    }
}

pub struct JsonLinesReader {
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    last_offset: u64,
    offset: u64,
    exhausted: bool,
}

impl EventReader for JsonLinesReader {
    type Event = Value;

    fn next_event(&mut self) -> Result<Option<Value>> {
        while !self.exhausted {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .with_context(|| format!("failed to read {}", self.path.display()))?;

            // A line without its terminator is still being written; leave it for the next open.
            if read == 0 || self.line.last() != Some(&b'\n') {
                self.exhausted = true;
                break;
            }

            let start = self.offset;
            self.offset += read as u64;

            let body = trim_line(&self.line);
            if body.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Value>(body) {
                Ok(event) => {
                    self.last_offset = start;
                    return Ok(Some(event));
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        offset = start,
                        error = %err,
                        line = %line_preview(body, LINE_PREVIEW_CHARS),
                        "malformed line; skipping"
                    );
                }
            }
        }
        Ok(None)
    }

    fn last_offset(&self) -> u64 {
        self.last_offset
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    let mut start = 0;
    while start < end && matches!(line[start], b' ' | b'\t') {
        start += 1;
    }
    &line[start..end]
}

fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview: String = text.chars().take(limit).collect();
    if text.chars().count() > limit {
        preview.push('…');
    }
    preview
}
