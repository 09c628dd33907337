//! Reference-anchored spike sorting stage.
//!
//! Matches a shifted segment's spike events against the reference template
//! set: frames inside the segment's high-activity intervals are masked out,
//! spikes are detected on the across-channel minimum at the coarse
//! threshold, and each detected frame vector is assigned to the nearest
//! template by Euclidean distance. The artifact carries spike times, unit
//! labels, amplitudes, and an unchanged copy of the template set for
//! traceability.

use crate::codec::SampleBlock;
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, SegmentRef};
use crate::reference::reference_templates_id;
use crate::stages::detect::detect_troughs;
use crate::stages::high_activity::{self, Interval};
use crate::stages::StageContext;
use crate::store::{ArtifactId, ArtifactStatus};
use std::path::Path;

/// Payload of one reference-sorting artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct SortingResult {
    /// Spike times in seconds from segment start.
    pub spike_times: Vec<f64>,
    /// 1-based unit label per spike.
    pub spike_labels: Vec<i64>,
    /// Spike amplitudes (magnitude of the deepest channel).
    pub spike_amplitudes: Vec<f64>,
    /// The template set the labels refer to.
    pub templates: Vec<Vec<f64>>,
}

impl SortingResult {
    /// Result with no spikes but a carried template set.
    #[must_use]
    pub fn empty(templates: Vec<Vec<f64>>) -> Self {
        Self {
            spike_times: Vec::new(),
            spike_labels: Vec::new(),
            spike_amplitudes: Vec::new(),
            templates,
        }
    }
}

/// Detected spikes outside the masked intervals: `(frame indices, frame
/// vectors)`.
#[must_use]
pub fn masked_spike_frames(
    block: &SampleBlock,
    intervals: &[Interval],
    sampling_frequency: f64,
    threshold: f64,
) -> (Vec<usize>, Vec<Vec<f64>>) {
    let num_frames = block.num_frames();
    let mut masked = vec![false; num_frames];
    for iv in intervals {
        let start = ((iv.start_sec * sampling_frequency) as usize).min(num_frames);
        let end = ((iv.end_sec * sampling_frequency) as usize).min(num_frames);
        for m in &mut masked[start..end] {
            *m = true;
        }
    }

    let mut min_trace = block.frame_min_f64();
    for (t, m) in masked.iter().enumerate() {
        if *m {
            min_trace[t] = 0.0;
        }
    }

    let indices = detect_troughs(&min_trace, threshold);
    let frames = indices
        .iter()
        .map(|&t| block.frame(t).iter().map(|&s| f64::from(s)).collect())
        .collect();
    (indices, frames)
}

/// Assign detected spikes to their nearest reference template.
#[must_use]
pub fn match_to_templates(
    block: &SampleBlock,
    intervals: &[Interval],
    templates: &[Vec<f64>],
    sampling_frequency: f64,
    threshold: f64,
) -> SortingResult {
    if templates.is_empty() {
        return SortingResult::empty(Vec::new());
    }
    let (indices, frames) = masked_spike_frames(block, intervals, sampling_frequency, threshold);

    let mut spike_times = Vec::with_capacity(indices.len());
    let mut spike_labels = Vec::with_capacity(indices.len());
    let mut spike_amplitudes = Vec::with_capacity(indices.len());
    for (t, frame) in indices.iter().zip(&frames) {
        spike_times.push(*t as f64 / sampling_frequency);
        spike_labels.push(nearest_template(frame, templates));
        let trough = frame.iter().copied().fold(f64::INFINITY, f64::min);
        spike_amplitudes.push(-trough);
    }

    SortingResult {
        spike_times,
        spike_labels,
        spike_amplitudes,
        templates: templates.to_vec(),
    }
}

fn nearest_template(frame: &[f64], templates: &[Vec<f64>]) -> i64 {
    let mut best = 0usize;
    let mut best_dist = f64::INFINITY;
    for (i, template) in templates.iter().enumerate() {
        let dist: f64 = frame
            .iter()
            .zip(template)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best as i64 + 1
}

/// Write a sorting result into an artifact directory (staging or final).
pub fn write_sorting(dir: &Path, result: &SortingResult) -> PipelineResult<()> {
    std::fs::write(
        dir.join("spike_times"),
        serde_json::to_vec(&result.spike_times)?,
    )?;
    std::fs::write(
        dir.join("spike_labels"),
        serde_json::to_vec(&result.spike_labels)?,
    )?;
    std::fs::write(
        dir.join("spike_amplitudes"),
        serde_json::to_vec(&result.spike_amplitudes)?,
    )?;
    std::fs::write(dir.join("templates"), serde_json::to_vec(&result.templates)?)?;
    Ok(())
}

/// Load the template set out of a committed sorting artifact.
pub fn load_templates(dir: &Path) -> PipelineResult<Vec<Vec<f64>>> {
    let bytes = std::fs::read(dir.join("templates"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Produce the reference-sorting artifact for one segment.
pub fn produce(segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
    let templates_id = reference_templates_id(ctx)?;
    if ctx.store.status(&templates_id) != ArtifactStatus::Present {
        return Err(PipelineError::MissingCalibration(format!(
            "reference templates not ready for {segment}"
        )));
    }

    let id = ArtifactId::segment(segment.clone(), ArtifactKind::ReferenceSorting);
    let claim = ctx.store.claim(&id)?;

    let templates = load_templates(&ctx.store.final_path(&templates_id))?;
    let shifted = ctx
        .codec()
        .read_all(&ctx.layout.artifact_path(segment, ArtifactKind::Shifted))?;
    let intervals = high_activity::load(
        &ctx.layout
            .artifact_path(segment, ArtifactKind::HighActivity),
    )?;

    let result = match_to_templates(
        &shifted,
        &intervals.high_activity_intervals,
        &templates,
        ctx.settings.sampling_frequency,
        ctx.settings.coarse_sorting_detect_threshold,
    );

    write_sorting(claim.staging_path(), &result)?;
    claim.commit()
}
