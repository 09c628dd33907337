//! Reference template extraction.
//!
//! Turns the spike events of the reference segment into a set of per-unit
//! waveform templates (one `n_channels`-wide frame vector per unit). The
//! clustering algorithm itself is a pluggable capability behind
//! [`TemplateClusterer`]; the built-in [`PeakChannelClusterer`] groups
//! detections by their most negative channel and takes per-channel medians,
//! which is enough to anchor template matching downstream. Units are ordered
//! by the x coordinate of their peak channel so labels are stable across
//! runs.

use crate::config::ElectrodeLayout;

/// Result of clustering detected spike frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    /// 1-based unit label per input frame, parallel to the input slice.
    pub labels: Vec<i64>,
    /// One template per unit, `n_channels` values each, indexed by label − 1.
    pub templates: Vec<Vec<f64>>,
}

impl ClusterOutcome {
    /// Outcome with no units, for segments with no detections.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            templates: Vec::new(),
        }
    }
}

/// Pluggable spike clustering capability.
pub trait TemplateClusterer: Send + Sync {
    /// Cluster spike frames into units and build per-unit templates.
    fn cluster(&self, frames: &[Vec<f64>], electrodes: &ElectrodeLayout) -> ClusterOutcome;
}

/// Default clusterer: one unit per peak channel, median template.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeakChannelClusterer;

impl TemplateClusterer for PeakChannelClusterer {
    fn cluster(&self, frames: &[Vec<f64>], electrodes: &ElectrodeLayout) -> ClusterOutcome {
        if frames.is_empty() {
            return ClusterOutcome::empty();
        }
        let n_channels = frames[0].len();

        let peak_channel_of: Vec<usize> = frames.iter().map(|f| argmin(f)).collect();

        // distinct peak channels, ordered by electrode x (ties by channel index)
        let mut units: Vec<usize> = {
            let mut seen: Vec<usize> = peak_channel_of.clone();
            seen.sort_unstable();
            seen.dedup();
            seen
        };
        units.sort_by(|&a, &b| {
            let xa = electrodes.coords().get(a).map_or(0.0, |c| c.0);
            let xb = electrodes.coords().get(b).map_or(0.0, |c| c.0);
            xa.partial_cmp(&xb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let label_of_channel = |ch: usize| -> i64 {
            units
                .iter()
                .position(|&u| u == ch)
                .map_or(0, |p| p as i64 + 1)
        };

        let labels: Vec<i64> = peak_channel_of.iter().map(|&ch| label_of_channel(ch)).collect();

        let templates = units
            .iter()
            .map(|&unit_ch| {
                let member_frames: Vec<&Vec<f64>> = frames
                    .iter()
                    .zip(&peak_channel_of)
                    .filter(|(_, &ch)| ch == unit_ch)
                    .map(|(f, _)| f)
                    .collect();
                (0..n_channels)
                    .map(|ch| median(member_frames.iter().map(|f| f[ch])))
                    .collect()
            })
            .collect();

        ClusterOutcome { labels, templates }
    }
}

fn argmin(frame: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in frame.iter().enumerate() {
        if v < frame[best] {
            best = i;
        }
    }
    best
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 1 {
        v[mid]
    } else {
        (v[mid - 1] + v[mid]) / 2.0
    }
}
