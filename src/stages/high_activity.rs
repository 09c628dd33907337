//! High-activity interval detection stage.
//!
//! Splits a segment into fixed windows and counts, per window, how many
//! channels fired at least once. Windows where that count exceeds the
//! configured threshold are merged into disjoint `[start_sec, end_sec)`
//! intervals. Detection reuses the statistics detector on the raw segment,
//! so the stage has no dependency beyond the raw file.

use crate::codec::SampleBlock;
use crate::error::PipelineResult;
use crate::layout::{ArtifactKind, SegmentRef};
use crate::stages::detect::detect_troughs;
use crate::stages::StageContext;
use crate::store::ArtifactId;
use serde::{Deserialize, Serialize};

/// Width of one activity-counting window, in seconds.
pub const WINDOW_SEC: f64 = 0.1;

/// One half-open high-activity interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Inclusive start, seconds from segment start.
    pub start_sec: f64,
    /// Exclusive end, seconds from segment start.
    pub end_sec: f64,
}

/// High-activity artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighActivityIntervals {
    /// Disjoint intervals in increasing time order.
    pub high_activity_intervals: Vec<Interval>,
}

/// Compute merged high-activity intervals for a block.
#[must_use]
pub fn compute(
    block: &SampleBlock,
    sampling_frequency: f64,
    detect_threshold: f64,
    high_activity_threshold: f64,
) -> HighActivityIntervals {
    let num_frames = block.num_frames();
    let window_frames = ((WINDOW_SEC * sampling_frequency).round() as usize).max(1);
    let n_windows = num_frames.div_ceil(window_frames);

    let mut active_counts = vec![0usize; n_windows];
    for ch in 0..block.n_channels {
        let samples = block.channel_f64(ch);
        let troughs = detect_troughs(&samples, detect_threshold);
        let mut last_window = usize::MAX;
        for idx in troughs {
            let w = idx / window_frames;
            if w != last_window {
                active_counts[w] += 1;
                last_window = w;
            }
        }
    }

    let mut intervals = Vec::new();
    let mut open: Option<usize> = None;
    for w in 0..n_windows {
        let high = active_counts[w] as f64 > high_activity_threshold;
        match (high, open) {
            (true, None) => open = Some(w),
            (false, Some(start)) => {
                intervals.push(window_span(start, w, window_frames, num_frames, sampling_frequency));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        intervals.push(window_span(
            start,
            n_windows,
            window_frames,
            num_frames,
            sampling_frequency,
        ));
    }

    HighActivityIntervals {
        high_activity_intervals: intervals,
    }
}

fn window_span(
    start_window: usize,
    end_window: usize,
    window_frames: usize,
    num_frames: usize,
    fs: f64,
) -> Interval {
    let start_frame = start_window * window_frames;
    let end_frame = (end_window * window_frames).min(num_frames);
    Interval {
        start_sec: start_frame as f64 / fs,
        end_sec: end_frame as f64 / fs,
    }
}

/// Produce the high-activity artifact for one raw segment.
pub fn produce(segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
    let id = ArtifactId::segment(segment.clone(), ArtifactKind::HighActivity);
    let claim = ctx.store.claim(&id)?;

    let block = ctx.codec().read_all(&ctx.layout.raw_segment_path(segment))?;
    let intervals = compute(
        &block,
        ctx.settings.sampling_frequency,
        ctx.settings.detect_threshold_for_spike_stats,
        ctx.settings.high_activity_threshold,
    );

    std::fs::write(claim.staging_path(), serde_json::to_vec_pretty(&intervals)?)?;
    claim.commit()
}

/// Load a committed high-activity artifact.
pub fn load(path: &std::path::Path) -> PipelineResult<HighActivityIntervals> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2-channel block with spikes of `amp` at the given (frame, channel)
    /// positions.
    fn block_with_spikes(num_frames: usize, spikes: &[(usize, usize)]) -> SampleBlock {
        let mut data = vec![0i16; num_frames * 2];
        for &(frame, ch) in spikes {
            data[frame * 2 + ch] = -100;
        }
        SampleBlock::new(data, 2).unwrap()
    }

    #[test]
    fn quiet_block_has_no_intervals() {
        let block = block_with_spikes(1000, &[]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert!(out.high_activity_intervals.is_empty());
    }

    #[test]
    fn concurrent_channels_open_an_interval() {
        // both channels spike inside the window [0.2, 0.3): count 2 > 1
        let block = block_with_spikes(1000, &[(210, 0), (250, 1)]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert_eq!(
            out.high_activity_intervals,
            vec![Interval {
                start_sec: 0.2,
                end_sec: 0.3,
            }]
        );
    }

    #[test]
    fn single_channel_does_not_exceed_threshold() {
        let block = block_with_spikes(1000, &[(210, 0)]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert!(out.high_activity_intervals.is_empty());
    }

    #[test]
    fn adjacent_high_windows_merge() {
        let block = block_with_spikes(
            1000,
            &[(110, 0), (130, 1), (210, 0), (230, 1)],
        );
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert_eq!(
            out.high_activity_intervals,
            vec![Interval {
                start_sec: 0.1,
                end_sec: 0.3,
            }]
        );
    }

    #[test]
    fn interval_clamps_to_segment_end() {
        // 950-frame partial segment, activity in the last (short) window
        let block = block_with_spikes(950, &[(920, 0), (930, 1)]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert_eq!(
            out.high_activity_intervals,
            vec![Interval {
                start_sec: 0.9,
                end_sec: 0.95,
            }]
        );
    }

    #[test]
    fn repeated_spikes_on_one_channel_count_once_per_window() {
        // channel 0 spikes twice in one window; channel 1 quiet: count stays 1
        let block = block_with_spikes(1000, &[(205, 0), (260, 0)]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        assert!(out.high_activity_intervals.is_empty());
    }

    #[test]
    fn json_round_trip() {
        let block = block_with_spikes(1000, &[(210, 0), (250, 1)]);
        let out = compute(&block, 1000.0, -40.0, 1.0);
        let json = serde_json::to_vec(&out).unwrap();
        let back: HighActivityIntervals = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, out);
    }
}
