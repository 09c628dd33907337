//! Reference manager: pointer tracking and one-time calibration.
//!
//! `reference_segment.txt` designates one raw segment as the calibration
//! reference. Once the pointer is set and the reference segment's
//! prerequisite artifacts exist, two one-time computations fire, both scoped
//! to the pointer identity:
//!
//! - **Shift-coefficient estimation** fits a single linear relationship
//!   between electrode position and propagation delay by grid search,
//!   maximizing the variance of the across-channel mean of the
//!   delay-compensated signal over the first half second of the reference
//!   segment. Committed to `computed/shift_coeffs.yaml`.
//! - **Reference template extraction** shift-compensates the reference
//!   segment in memory, masks its high-activity intervals, detects spikes at
//!   the coarse threshold and clusters them into per-unit templates.
//!   Committed as the reference segment's `reference_sorting` artifact,
//!   which doubles as the global template set.
//!
//! State machine: `NoReference → CalibrationPending → CalibrationReady`.
//! Re-pointing to a different segment invalidates the coefficients, every
//! shifted artifact and every sorting artifact, and drops back to
//! `CalibrationPending`; nothing reference-derived is ever left silently
//! stale. The manager runs between dispatch rounds, so invalidation never
//! races an in-flight claim.

use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, ExperimentLayout, SegmentRef};
use crate::stages::high_activity;
use crate::stages::shift::{apply_shifts, channel_shift_frames};
use crate::stages::sorting::{masked_spike_frames, write_sorting, SortingResult};
use crate::stages::templates::{PeakChannelClusterer, TemplateClusterer};
use crate::stages::StageContext;
use crate::codec::SampleBlock;
use crate::config::ElectrodeLayout;
use crate::store::{ArtifactId, ArtifactStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Seconds of reference signal used for coefficient estimation.
pub const CALIBRATION_WINDOW_SEC: f64 = 0.5;

/// Largest relative delay, in seconds, the coefficient grid explores across
/// the array.
const MAX_CHANNEL_DELAY_SEC: f64 = 2.0e-3;

/// Grid candidates per coefficient axis (odd, so zero is always a candidate).
const GRID_STEPS: usize = 11;

/// The global shift-coefficient calibration artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftCoefficients {
    /// Delay per unit of electrode x coordinate, in seconds.
    pub c_x: f64,
    /// Delay per unit of electrode y coordinate, in seconds.
    pub c_y: f64,
}

impl ShiftCoefficients {
    /// Load from `computed/shift_coeffs.yaml`.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Calibration readiness, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// No reference segment has been designated.
    NoReference,
    /// A reference is set; calibration artifacts are not all present yet.
    CalibrationPending,
    /// Shift coefficients and reference templates are both present.
    CalibrationReady,
}

impl std::fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationState::NoReference => f.write_str("no_reference"),
            CalibrationState::CalibrationPending => f.write_str("calibration_pending"),
            CalibrationState::CalibrationReady => f.write_str("calibration_ready"),
        }
    }
}

/// Read and parse `reference_segment.txt`. Missing or empty means no
/// reference; malformed content is a format error.
pub fn read_pointer(layout: &ExperimentLayout) -> PipelineResult<Option<SegmentRef>> {
    let path = layout.reference_pointer_path();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    SegmentRef::parse(trimmed).map(Some)
}

/// Artifact id of the global template set: the reference segment's sorting
/// artifact.
pub fn reference_templates_id(ctx: &StageContext) -> PipelineResult<ArtifactId> {
    match read_pointer(&ctx.layout)? {
        Some(segment) => Ok(ArtifactId::segment(segment, ArtifactKind::ReferenceSorting)),
        None => Err(PipelineError::MissingCalibration(
            "no reference segment set".into(),
        )),
    }
}

/// Tracks the reference pointer and drives the one-time calibration.
pub struct ReferenceManager {
    ctx: StageContext,
    clusterer: Box<dyn TemplateClusterer>,
    pointer: Option<SegmentRef>,
    last_state: Option<CalibrationState>,
}

impl std::fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("pointer", &self.pointer)
            .field("last_state", &self.last_state)
            .finish()
    }
}

impl ReferenceManager {
    /// Manager with the default clusterer.
    #[must_use]
    pub fn new(ctx: StageContext) -> Self {
        Self::with_clusterer(ctx, Box::new(PeakChannelClusterer))
    }

    /// Manager with a custom clustering capability.
    #[must_use]
    pub fn with_clusterer(ctx: StageContext, clusterer: Box<dyn TemplateClusterer>) -> Self {
        Self {
            ctx,
            clusterer,
            pointer: None,
            last_state: None,
        }
    }

    /// The currently tracked pointer, if any.
    #[must_use]
    pub fn pointer(&self) -> Option<&SegmentRef> {
        self.pointer.as_ref()
    }

    /// Re-read the pointer, run any due calibration work, and report the
    /// resulting state. Called once per scheduler cycle, between dispatch
    /// rounds.
    pub fn update(&mut self) -> PipelineResult<CalibrationState> {
        let next = match read_pointer(&self.ctx.layout) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable reference pointer");
                self.pointer.clone()
            }
        };

        if next != self.pointer {
            if let (Some(prev), Some(new)) = (&self.pointer, &next) {
                info!(
                    from = %prev,
                    to = %new,
                    "reference segment re-pointed, invalidating derived artifacts"
                );
                self.invalidate_reference_artifacts()?;
            }
            self.pointer = next;
        }

        let state = self.drive_calibration()?;
        if self.last_state != Some(state) {
            info!(state = %state, "calibration state");
            self.last_state = Some(state);
        }
        Ok(state)
    }

    fn drive_calibration(&mut self) -> PipelineResult<CalibrationState> {
        let Some(reference) = self.pointer.clone() else {
            return Ok(CalibrationState::NoReference);
        };
        if !self.ctx.layout.raw_segment_path(&reference).exists() {
            return Ok(CalibrationState::CalibrationPending);
        }

        let coeffs_ready = self.ensure_shift_coeffs(&reference)?;
        let templates_ready = coeffs_ready && self.ensure_templates(&reference)?;

        if coeffs_ready && templates_ready {
            Ok(CalibrationState::CalibrationReady)
        } else {
            Ok(CalibrationState::CalibrationPending)
        }
    }

    fn invalidate_reference_artifacts(&self) -> PipelineResult<()> {
        self.ctx.store.invalidate(&ArtifactId::ShiftCoeffs)?;
        self.ctx.store.invalidate_kind(ArtifactKind::Shifted)?;
        self.ctx
            .store
            .invalidate_kind(ArtifactKind::ReferenceSorting)?;
        Ok(())
    }

    /// Estimate and commit the shift coefficients. True once present.
    fn ensure_shift_coeffs(&self, reference: &SegmentRef) -> PipelineResult<bool> {
        if self.ctx.store.is_present(&ArtifactId::ShiftCoeffs) {
            return Ok(true);
        }
        let filt_id = ArtifactId::segment(reference.clone(), ArtifactKind::Filt);
        if self.ctx.store.status(&filt_id) != ArtifactStatus::Present {
            return Ok(false);
        }

        let codec = self.ctx.codec();
        let filt_path = self.ctx.layout.artifact_path(reference, ArtifactKind::Filt);
        let block = codec.read_seconds(&filt_path, 0.0, CALIBRATION_WINDOW_SEC)?;
        let coeffs = estimate_shift_coefficients(
            &block,
            &self.ctx.electrodes,
            self.ctx.settings.sampling_frequency,
        );

        let claim = match self.ctx.store.claim(&ArtifactId::ShiftCoeffs) {
            Ok(claim) => claim,
            Err(err) if err.is_benign() => return Ok(false),
            Err(err) => return Err(err),
        };
        std::fs::write(claim.staging_path(), serde_yaml::to_string(&coeffs)?)?;
        claim.commit()?;
        info!(
            reference = %reference,
            c_x = coeffs.c_x,
            c_y = coeffs.c_y,
            "estimated shift coefficients"
        );
        Ok(true)
    }

    /// Extract and commit the reference template set. True once present.
    fn ensure_templates(&self, reference: &SegmentRef) -> PipelineResult<bool> {
        let sorting_id = ArtifactId::segment(reference.clone(), ArtifactKind::ReferenceSorting);
        if self.ctx.store.is_present(&sorting_id) {
            return Ok(true);
        }
        let filt_id = ArtifactId::segment(reference.clone(), ArtifactKind::Filt);
        let ha_id = ArtifactId::segment(reference.clone(), ArtifactKind::HighActivity);
        if !self.ctx.store.is_present(&filt_id) || !self.ctx.store.is_present(&ha_id) {
            return Ok(false);
        }

        let settings = &self.ctx.settings;
        let codec = self.ctx.codec();
        let coeffs = ShiftCoefficients::load(&self.ctx.layout.shift_coeffs_path())?;
        let block = codec.read_all(&self.ctx.layout.artifact_path(reference, ArtifactKind::Filt))?;
        let shifts =
            channel_shift_frames(&self.ctx.electrodes, settings.sampling_frequency, &coeffs);
        let shifted = SampleBlock {
            data: apply_shifts(&block, &shifts),
            n_channels: block.n_channels,
        };
        let intervals = high_activity::load(
            &self
                .ctx
                .layout
                .artifact_path(reference, ArtifactKind::HighActivity),
        )?;

        let (indices, frames) = masked_spike_frames(
            &shifted,
            &intervals.high_activity_intervals,
            settings.sampling_frequency,
            settings.coarse_sorting_detect_threshold,
        );
        let outcome = self.clusterer.cluster(&frames, &self.ctx.electrodes);

        let mut spike_amplitudes = Vec::with_capacity(frames.len());
        for frame in &frames {
            let trough = frame.iter().copied().fold(f64::INFINITY, f64::min);
            spike_amplitudes.push(-trough);
        }
        let result = SortingResult {
            spike_times: indices
                .iter()
                .map(|&t| t as f64 / settings.sampling_frequency)
                .collect(),
            spike_labels: outcome.labels,
            spike_amplitudes,
            templates: outcome.templates,
        };

        let claim = match self.ctx.store.claim(&sorting_id) {
            Ok(claim) => claim,
            Err(err) if err.is_benign() => return Ok(false),
            Err(err) => return Err(err),
        };
        write_sorting(claim.staging_path(), &result)?;
        claim.commit()?;
        info!(
            reference = %reference,
            spikes = result.spike_times.len(),
            units = result.templates.len(),
            "extracted reference templates"
        );
        Ok(true)
    }
}

/// Grid-search fit of the delay-vs-position coefficients.
///
/// Candidate coefficients are evaluated with exactly the per-channel shifts
/// the shift stage would apply, averaging across channels per frame and
/// scoring the variance of that mean: aligned spikes reinforce, misaligned
/// ones cancel.
#[must_use]
pub fn estimate_shift_coefficients(
    block: &SampleBlock,
    electrodes: &ElectrodeLayout,
    sampling_frequency: f64,
) -> ShiftCoefficients {
    let n_channels = block.n_channels.min(electrodes.len());
    let num_frames = block.num_frames();
    if num_frames == 0 || n_channels == 0 {
        return ShiftCoefficients { c_x: 0.0, c_y: 0.0 };
    }
    let channels: Vec<Vec<f64>> = (0..n_channels).map(|ch| block.channel_f64(ch)).collect();

    let xs: Vec<f64> = electrodes.coords()[..n_channels].iter().map(|c| c.0).collect();
    let ys: Vec<f64> = electrodes.coords()[..n_channels].iter().map(|c| c.1).collect();
    let candidates_x = axis_candidates(&xs);
    let candidates_y = axis_candidates(&ys);

    let mut best = ShiftCoefficients { c_x: 0.0, c_y: 0.0 };
    let mut best_score = f64::NEG_INFINITY;
    for &c_x in &candidates_x {
        for &c_y in &candidates_y {
            let shifts: Vec<isize> = xs
                .iter()
                .zip(&ys)
                .map(|(&x, &y)| ((c_x * x + c_y * y) * sampling_frequency).round() as isize)
                .collect();

            let score = alignment_score(&channels, &shifts, num_frames);
            if score > best_score {
                best_score = score;
                best = ShiftCoefficients { c_x, c_y };
            }
        }
    }
    best
}

fn axis_candidates(coords: &[f64]) -> Vec<f64> {
    let mean = coords.iter().sum::<f64>() / coords.len() as f64;
    let span = coords
        .iter()
        .map(|c| (c - mean).abs())
        .fold(0.0f64, f64::max);
    if span == 0.0 {
        return vec![0.0];
    }
    let max_c = MAX_CHANNEL_DELAY_SEC / span;
    (0..GRID_STEPS)
        .map(|i| -max_c + 2.0 * max_c * i as f64 / (GRID_STEPS - 1) as f64)
        .collect()
}

fn alignment_score(channels: &[Vec<f64>], shifts: &[isize], num_frames: usize) -> f64 {
    let n = channels.len() as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for t in 0..num_frames {
        let mut acc = 0.0;
        for (ch, samples) in channels.iter().enumerate() {
            let src = t as isize + shifts[ch];
            if src >= 0 && (src as usize) < num_frames {
                acc += samples[src as usize];
            }
        }
        let mean = acc / n;
        sum += mean;
        sum_sq += mean * mean;
    }
    let t_len = num_frames as f64;
    sum_sq / t_len - (sum / t_len) * (sum / t_len)
}
