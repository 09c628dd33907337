//! Stage workers.
//!
//! Each stage is a deterministic function from immutable inputs (a raw or
//! derived segment, plus a declared calibration dependency) to exactly one
//! artifact. Determinism matters: the scheduler treats "artifact present" as
//! a sound substitute for "work done", so a retried stage must reproduce the
//! same result. Stages claim their output key before doing any work and
//! publish through the store's atomic commit.

pub mod detect;
pub mod filter;
pub mod high_activity;
pub mod shift;
pub mod sorting;
pub mod stats;
pub mod templates;

use crate::codec::SegmentCodec;
use crate::config::{ElectrodeLayout, Settings};
use crate::error::PipelineResult;
use crate::layout::{ArtifactKind, ExperimentLayout, SegmentRef};
use crate::store::ArtifactStore;
use std::fmt;
use std::sync::Arc;

/// Shared, cloneable context handed to every stage worker.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Experiment settings.
    pub settings: Arc<Settings>,
    /// Electrode coordinate table.
    pub electrodes: Arc<ElectrodeLayout>,
    /// Directory layout.
    pub layout: ExperimentLayout,
    /// Artifact store.
    pub store: ArtifactStore,
}

impl StageContext {
    /// Codec configured for this experiment.
    #[must_use]
    pub fn codec(&self) -> SegmentCodec {
        SegmentCodec::new(self.settings.n_channels, self.settings.sampling_frequency)
    }
}

/// The five per-segment stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Band-pass filtering of the raw segment.
    Filter,
    /// Per-channel spike statistics.
    Stats,
    /// High-activity interval detection.
    HighActivity,
    /// Time-shift correction of the filtered segment.
    Shift,
    /// Reference-anchored spike sorting.
    ReferenceSorting,
}

impl StageKind {
    /// Every stage, in dependency-friendly order.
    pub const ALL: [StageKind; 5] = [
        StageKind::Filter,
        StageKind::Stats,
        StageKind::HighActivity,
        StageKind::Shift,
        StageKind::ReferenceSorting,
    ];

    /// The artifact kind this stage produces.
    #[must_use]
    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            StageKind::Filter => ArtifactKind::Filt,
            StageKind::Stats => ArtifactKind::Stats,
            StageKind::HighActivity => ArtifactKind::HighActivity,
            StageKind::Shift => ArtifactKind::Shifted,
            StageKind::ReferenceSorting => ArtifactKind::ReferenceSorting,
        }
    }

    /// True for stages gated on the reference calibration.
    #[must_use]
    pub fn requires_calibration(self) -> bool {
        matches!(self, StageKind::Shift | StageKind::ReferenceSorting)
    }

    /// Readiness predicate: are this stage's declared dependencies satisfied
    /// for the given segment? The raw segment itself exists by construction
    /// (the scheduler only evaluates scanned segments).
    #[must_use]
    pub fn is_ready(
        self,
        segment: &SegmentRef,
        store: &ArtifactStore,
        calibration_ready: bool,
    ) -> bool {
        use crate::store::ArtifactId;
        let present = |kind: ArtifactKind| {
            store.is_present(&ArtifactId::segment(segment.clone(), kind))
        };
        match self {
            StageKind::Filter | StageKind::Stats | StageKind::HighActivity => true,
            StageKind::Shift => calibration_ready && present(ArtifactKind::Filt),
            StageKind::ReferenceSorting => {
                calibration_ready
                    && present(ArtifactKind::Shifted)
                    && present(ArtifactKind::HighActivity)
            }
        }
    }

    /// Run the stage for one segment, producing its artifact.
    pub fn produce(self, segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
        match self {
            StageKind::Filter => filter::produce(segment, ctx),
            StageKind::Stats => stats::produce(segment, ctx),
            StageKind::HighActivity => high_activity::produce(segment, ctx),
            StageKind::Shift => shift::produce(segment, ctx),
            StageKind::ReferenceSorting => sorting::produce(segment, ctx),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Filter => "filter",
            StageKind::Stats => "stats",
            StageKind::HighActivity => "high_activity",
            StageKind::Shift => "shift",
            StageKind::ReferenceSorting => "reference_sorting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactId;

    fn context() -> (tempfile::TempDir, StageContext) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ExperimentLayout::new(dir.path());
        let settings = Settings {
            n_channels: 2,
            sampling_frequency: 1000.0,
            raw_segment_duration_sec: 1.0,
            filter_params: crate::config::FilterParams {
                lowcut: 10.0,
                highcut: 300.0,
                order: 2,
            },
            detect_threshold_for_spike_stats: -40.0,
            coarse_sorting_detect_threshold: -80.0,
            high_activity_threshold: 10.0,
            poll_interval_sec: 0.0,
            seal_quiet_sec: 0.0,
            max_concurrent_stage_tasks: 2,
            log_level: "info".into(),
        };
        let ctx = StageContext {
            settings: Arc::new(settings),
            electrodes: Arc::new(ElectrodeLayout::new(vec![(0.0, 0.0), (30.0, 0.0)])),
            layout: layout.clone(),
            store: ArtifactStore::new(layout),
        };
        (dir, ctx)
    }

    #[test]
    fn raw_only_stages_always_ready() {
        let (_dir, ctx) = context();
        let seg = SegmentRef::from_index("eb", 1);
        for kind in [StageKind::Filter, StageKind::Stats, StageKind::HighActivity] {
            assert!(kind.is_ready(&seg, &ctx.store, false));
            assert!(!kind.requires_calibration());
        }
    }

    #[test]
    fn shift_gated_on_calibration_and_filter() {
        let (_dir, ctx) = context();
        let seg = SegmentRef::from_index("eb", 1);
        assert!(!StageKind::Shift.is_ready(&seg, &ctx.store, false));
        assert!(!StageKind::Shift.is_ready(&seg, &ctx.store, true));

        let claim = ctx
            .store
            .claim(&ArtifactId::segment(seg.clone(), ArtifactKind::Filt))
            .unwrap();
        std::fs::write(claim.staging_path(), b"").unwrap();
        claim.commit().unwrap();

        assert!(StageKind::Shift.is_ready(&seg, &ctx.store, true));
        assert!(!StageKind::Shift.is_ready(&seg, &ctx.store, false));
    }

    #[test]
    fn sorting_needs_shifted_and_high_activity() {
        let (_dir, ctx) = context();
        let seg = SegmentRef::from_index("eb", 1);
        for kind in [ArtifactKind::Shifted, ArtifactKind::HighActivity] {
            assert!(!StageKind::ReferenceSorting.is_ready(&seg, &ctx.store, true));
            let claim = ctx
                .store
                .claim(&ArtifactId::segment(seg.clone(), kind))
                .unwrap();
            std::fs::write(claim.staging_path(), b"").unwrap();
            claim.commit().unwrap();
        }
        assert!(StageKind::ReferenceSorting.is_ready(&seg, &ctx.store, true));
    }

    #[test]
    fn stage_to_artifact_kind_mapping() {
        assert_eq!(StageKind::Filter.artifact_kind(), ArtifactKind::Filt);
        assert_eq!(
            StageKind::ReferenceSorting.artifact_kind(),
            ArtifactKind::ReferenceSorting
        );
    }
}
