//! Tracing initialization.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`.
//! The filter comes from `RUST_LOG` when set, otherwise from the configured
//! `log_level` directive.

use crate::error::{PipelineError, PipelineResult};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Safe to call once per process; a second
/// call in the same process (e.g. from tests) is reported as an error by the
/// subscriber and ignored here.
pub fn init(log_level: &str) -> PipelineResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|err| {
            PipelineError::Configuration(format!("invalid log filter '{log_level}': {err}"))
        })?;

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_rejected() {
        assert!(matches!(
            init("not a [ filter"),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn valid_directive_accepted() {
        assert!(init("info").is_ok());
        // idempotent across repeated calls
        assert!(init("debug").is_ok());
    }
}
