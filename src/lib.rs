//! # MEA Pipeline Library
//!
//! Staged, idempotent processing for continuously arriving multi-electrode
//! array recordings. An experiment directory is watched for sealed
//! acquisition epoch blocks; each is rechunked into fixed-duration binary
//! segments, and a set of per-segment artifacts (filtered signal, spike
//! statistics, high-activity intervals, time-shift-corrected signal,
//! reference-anchored spike sorting) is derived incrementally without ever
//! redoing work that is already visible on disk.
//!
//! ## Crate Structure
//!
//! - **`codec`**: fixed-layout i16 binary segment reader/writer with
//!   frame-range access and atomic writes.
//! - **`config`**: experiment settings (`experiment.yaml`) and the electrode
//!   coordinate table, with semantic validation.
//! - **`error`**: the central `PipelineError` enum.
//! - **`layout`**: the on-disk directory tree and artifact naming scheme.
//! - **`logging`**: tracing-subscriber initialization.
//! - **`monitor`**: detects acquisition epoch blocks that have sealed.
//! - **`rechunker`**: splits sealed epoch blocks into raw segments.
//! - **`store`**: artifact status, atomic claim/commit, invalidation; the
//!   single source of processing state.
//! - **`reference`**: reference segment pointer and the one-time calibration
//!   (shift coefficients, reference templates).
//! - **`stages`**: the per-segment stage workers.
//! - **`scheduler`**: the polling cycle with bounded-concurrency dispatch.
//! - **`query`**: existence flags and time-range reads for the external
//!   query layer.

pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod logging;
pub mod monitor;
pub mod query;
pub mod rechunker;
pub mod reference;
pub mod scheduler;
pub mod stages;
pub mod store;

pub use config::{ElectrodeLayout, Settings};
pub use error::{PipelineError, PipelineResult};
pub use layout::{ArtifactKind, ExperimentLayout, SegmentRef};
pub use reference::CalibrationState;
pub use scheduler::Scheduler;
pub use store::{ArtifactId, ArtifactStatus, ArtifactStore};
