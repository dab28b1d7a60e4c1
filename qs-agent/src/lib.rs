//! qs-agent: resumable ingestion of date-partitioned query-history logs.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod reader;
pub mod runner;
pub mod scanner;
pub mod tracker;
pub mod watcher;

pub use error::{PipelineError, PipelineState};
pub use pipeline::{Collaborators, IngestionPipeline, PipelineSettings};
