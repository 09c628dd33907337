//! Read surface for the external query layer.
//!
//! The HTTP layer that serves clients is an external collaborator; this
//! module exposes the two primitives it consumes: per-segment existence
//! flags for every artifact kind, and `[start_sec, end_sec)` sample reads of
//! any raw, filtered, or shifted segment file.

use crate::codec::{SampleBlock, SegmentCodec};
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, ExperimentLayout, SegmentRef};
use crate::store::{ArtifactId, ArtifactStore};
use serde::Serialize;
use std::path::PathBuf;

/// Which artifacts exist for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentArtifacts {
    /// The raw segment file itself.
    pub raw: bool,
    /// Filtered binary artifact.
    pub filt: bool,
    /// Spike statistics artifact.
    pub stats: bool,
    /// High-activity intervals artifact.
    pub high_activity: bool,
    /// Shifted binary artifact.
    pub shifted: bool,
    /// Reference-sorting artifact directory.
    pub reference_sorting: bool,
}

/// Addressable signal layers for time-range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// `raw/<eb>/segment_NNN.bin`
    Raw,
    /// `computed/filt/.../segment_NNN.bin.filt`
    Filtered,
    /// `computed/shifted/.../segment_NNN.bin.shifted`
    Shifted,
}

/// Query service over one experiment tree.
#[derive(Debug, Clone)]
pub struct QueryService {
    layout: ExperimentLayout,
    store: ArtifactStore,
    codec: SegmentCodec,
}

impl QueryService {
    /// Service over the given layout and codec parameters.
    #[must_use]
    pub fn new(layout: ExperimentLayout, codec: SegmentCodec) -> Self {
        let store = ArtifactStore::new(layout.clone());
        Self {
            layout,
            store,
            codec,
        }
    }

    /// Existence flags for one segment.
    #[must_use]
    pub fn segment_artifacts(&self, segment: &SegmentRef) -> SegmentArtifacts {
        let present = |kind: ArtifactKind| {
            self.store
                .is_present(&ArtifactId::segment(segment.clone(), kind))
        };
        SegmentArtifacts {
            raw: self.layout.raw_segment_path(segment).exists(),
            filt: present(ArtifactKind::Filt),
            stats: present(ArtifactKind::Stats),
            high_activity: present(ArtifactKind::HighActivity),
            shifted: present(ArtifactKind::Shifted),
            reference_sorting: present(ArtifactKind::ReferenceSorting),
        }
    }

    /// All known raw segments, in (epoch block, index) order.
    pub fn list_segments(&self) -> PipelineResult<Vec<SegmentRef>> {
        self.layout.scan_raw_segments()
    }

    /// Read `[start_sec, end_sec)` of one signal layer.
    pub fn read_signal(
        &self,
        kind: SignalKind,
        segment: &SegmentRef,
        start_sec: f64,
        end_sec: f64,
    ) -> PipelineResult<SampleBlock> {
        let path = self.signal_path(kind, segment);
        if !path.exists() {
            return Err(PipelineError::Format(format!(
                "no {kind:?} signal for {segment}"
            )));
        }
        self.codec.read_seconds(&path, start_sec, end_sec)
    }

    fn signal_path(&self, kind: SignalKind, segment: &SegmentRef) -> PathBuf {
        match kind {
            SignalKind::Raw => self.layout.raw_segment_path(segment),
            SignalKind::Filtered => self.layout.artifact_path(segment, ArtifactKind::Filt),
            SignalKind::Shifted => self.layout.artifact_path(segment, ArtifactKind::Shifted),
        }
    }
}
