use std::fmt;
use thiserror::Error;

/// Lifecycle phase of an ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Running,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "init",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot {operation} pipeline: expected state {expected}, found {actual}")]
    InvalidState {
        operation: &'static str,
        expected: PipelineState,
        actual: PipelineState,
    },

    #[error("pipeline must be started from within a tokio runtime")]
    NoRuntime,

    #[error("failed to load persisted offsets: {0:#}")]
    LoadOffsets(anyhow::Error),
}

impl PipelineError {
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, PipelineError::InvalidState { .. })
    }
}
