//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `PipelineError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different failure classes the pipeline can encounter:
//!
//! - **`Config`**: Wraps errors from the `config` crate (file parsing, missing
//!   keys, format problems in `experiment.yaml`).
//! - **`Configuration`**: Semantic errors that pass parsing but are logically
//!   invalid (a non-negative detection threshold, a filter band outside
//!   Nyquist). These are caught during the validation step.
//! - **`Io`**: Wraps `std::io::Error` for all file-system access.
//! - **`Format`**: A segment or coordinate file whose byte layout does not
//!   match the declared channel count and sample width.
//! - **`MissingCalibration`**: A shift or sorting stage was asked to run before
//!   the reference calibration is ready. This is a deferred state, not a
//!   durable failure; the scheduler retries on a later cycle.
//! - **`ClaimConflict`**: Another worker is already producing the same
//!   artifact. Benign; the losing work item is simply dropped.
//! - **`StageCompute`**: A numeric failure inside a stage computation, e.g.
//!   filter design on a degenerate band.
//!
//! `ClaimConflict` and `MissingCalibration` are *benign*: they describe work
//! that should be skipped or deferred, never surfaced as a pipeline failure.
//! [`PipelineError::is_benign`] lets the scheduler make that distinction.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Central error type for the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File-system I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A binary segment or coordinate file has an invalid byte layout.
    #[error("Format error: {0}")]
    Format(String),

    /// A calibration-dependent stage ran before calibration was ready.
    #[error("Calibration not ready: {0}")]
    MissingCalibration(String),

    /// The artifact is already being produced by another worker.
    #[error("Artifact already claimed: {0}")]
    ClaimConflict(String),

    /// Numeric failure inside a stage computation.
    #[error("Stage computation error: {0}")]
    StageCompute(String),

    /// JSON encode/decode failure for a structured artifact.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encode/decode failure (shift coefficients, config template).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// True for errors that describe deferred or redundant work rather than a
    /// real failure. The scheduler logs these at debug level and moves on.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            PipelineError::ClaimConflict(_) | PipelineError::MissingCalibration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_conflict_is_benign() {
        let err = PipelineError::ClaimConflict("computed/filt/a/b".into());
        assert!(err.is_benign());
    }

    #[test]
    fn format_error_is_not_benign() {
        let err = PipelineError::Format("truncated segment".into());
        assert!(!err.is_benign());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
