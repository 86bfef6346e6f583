//! Error types for pipeline runs.
//!
//! Configuration errors are raised before any stage starts. Step failures
//! carry enough context (stage, unit, step) to produce a readable message
//! at the process boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Mutually exclusive options, missing inputs, malformed values.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external step exited unsuccessfully after exhausting its attempts.
    #[error("step `{step}` failed after {attempts} attempt(s) with {status}")]
    StepFailed {
        step: String,
        status: String,
        attempts: u32,
    },

    /// The external program could not be started at all.
    #[error("failed to spawn `{program}` for step `{step}`: {source}")]
    Spawn {
        step: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A step reported success but did not produce every declared output.
    #[error("step `{step}` did not produce declared output {}", path.display())]
    MissingOutput { step: String, path: PathBuf },

    /// A failure inside one unit of a stage fan-out.
    #[error("stage `{stage}` failed for {unit}: {source}")]
    Unit {
        stage: String,
        unit: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Malformed input document (reference polygons, strata layout, LUT).
    #[error("invalid input {}: {message}", path.display())]
    InvalidInput { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker task panicked or was cancelled.
    #[error("task join error: {0}")]
    Join(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_input(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Attach the stage and unit a failure happened in.
    pub fn in_unit(self, stage: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::Unit {
            stage: stage.into(),
            unit: unit.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error came from an external step rather than from setup.
    pub fn is_step_failure(&self) -> bool {
        match self {
            Self::StepFailed { .. } | Self::Spawn { .. } | Self::MissingOutput { .. } => true,
            Self::Unit { source, .. } => source.is_step_failure(),
            _ => false,
        }
    }
}
