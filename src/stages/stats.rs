//! Per-channel spike statistics stage.
//!
//! Detects spikes on each raw channel against the configured signed
//! threshold and reports, per channel, the mean firing rate (detections per
//! second of segment) and the mean spike amplitude (magnitude of the signal
//! at each detected trough). Channels with no detections report zeros.

use crate::codec::SampleBlock;
use crate::error::PipelineResult;
use crate::layout::{ArtifactKind, SegmentRef};
use crate::stages::detect::detect_troughs;
use crate::stages::StageContext;
use crate::store::ArtifactId;
use serde::{Deserialize, Serialize};

/// Per-channel spike statistics artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpikeStats {
    /// Detections per second, one entry per channel.
    pub mean_firing_rates: Vec<f64>,
    /// Mean |trough value|, one entry per channel; 0 with no detections.
    pub mean_spike_amplitudes: Vec<f64>,
}

/// Compute spike statistics for every channel of a block.
#[must_use]
pub fn compute(block: &SampleBlock, sampling_frequency: f64, threshold: f64) -> ChannelSpikeStats {
    let duration_sec = block.num_frames() as f64 / sampling_frequency;
    let mut mean_firing_rates = Vec::with_capacity(block.n_channels);
    let mut mean_spike_amplitudes = Vec::with_capacity(block.n_channels);

    for ch in 0..block.n_channels {
        let samples = block.channel_f64(ch);
        let troughs = detect_troughs(&samples, threshold);
        let rate = if duration_sec > 0.0 {
            troughs.len() as f64 / duration_sec
        } else {
            0.0
        };
        let amplitude = if troughs.is_empty() {
            0.0
        } else {
            troughs.iter().map(|&i| samples[i].abs()).sum::<f64>() / troughs.len() as f64
        };
        mean_firing_rates.push(rate);
        mean_spike_amplitudes.push(amplitude);
    }

    ChannelSpikeStats {
        mean_firing_rates,
        mean_spike_amplitudes,
    }
}

/// Produce the statistics artifact for one raw segment.
pub fn produce(segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
    let id = ArtifactId::segment(segment.clone(), ArtifactKind::Stats);
    let claim = ctx.store.claim(&id)?;

    let block = ctx.codec().read_all(&ctx.layout.raw_segment_path(segment))?;
    let stats = compute(
        &block,
        ctx.settings.sampling_frequency,
        ctx.settings.detect_threshold_for_spike_stats,
    );

    std::fs::write(claim.staging_path(), serde_json::to_vec_pretty(&stats)?)?;
    claim.commit()
}
