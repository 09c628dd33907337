//! Configuration management.
//!
//! Loads the experiment configuration (`experiment.yaml`) through the `config`
//! crate and applies a semantic validation pass afterwards: values that parse
//! fine can still be logically wrong (a positive spike-detection threshold, a
//! filter band outside Nyquist), and those are rejected here rather than deep
//! inside a stage worker.
//!
//! The electrode coordinate table (`electrode_coords.txt`, one `x y` pair per
//! channel) is loaded separately via [`ElectrodeLayout::load`].

use crate::error::{PipelineError, PipelineResult};
use config::Config;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the experiment configuration file, relative to the experiment root.
pub const CONFIG_FILE: &str = "experiment.yaml";

/// Name of the electrode coordinate table, relative to the experiment root.
pub const ELECTRODE_COORDS_FILE: &str = "electrode_coords.txt";

/// Band-pass filter parameters for the filtering stage.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FilterParams {
    /// Lower band edge in Hz.
    pub lowcut: f64,
    /// Upper band edge in Hz.
    pub highcut: f64,
    /// Filter order; realized as ⌈order/2⌉ biquad sections per band edge.
    pub order: usize,
}

/// Experiment settings, deserialized from `experiment.yaml`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Number of recording channels per frame.
    pub n_channels: usize,
    /// Acquisition sampling frequency in Hz.
    pub sampling_frequency: f64,
    /// Duration of one raw segment in seconds.
    pub raw_segment_duration_sec: f64,
    /// Band-pass filter parameters.
    pub filter_params: FilterParams,
    /// Signed detection threshold for spike statistics. Spikes are negative
    /// deflections past this value, so it must be negative.
    pub detect_threshold_for_spike_stats: f64,
    /// Signed, more permissive threshold used for reference template
    /// extraction and template matching. Must be negative.
    pub coarse_sorting_detect_threshold: f64,
    /// Minimum number of concurrently active channels for a window to count
    /// as high-activity.
    pub high_activity_threshold: f64,
    /// Scheduler poll interval in seconds.
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: f64,
    /// Quiet window in seconds an epoch block manifest must stay unchanged
    /// before the block is considered sealed.
    #[serde(default = "default_seal_quiet_sec")]
    pub seal_quiet_sec: f64,
    /// Upper bound on concurrently running stage tasks.
    #[serde(default = "default_max_concurrent_stage_tasks")]
    pub max_concurrent_stage_tasks: usize,
    /// Log filter directive, e.g. `info` or `mea_pipeline=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval_sec() -> f64 {
    5.0
}

fn default_seal_quiet_sec() -> f64 {
    5.0
}

fn default_max_concurrent_stage_tasks() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load and validate settings from `<root>/experiment.yaml`.
    pub fn load(root: &Path) -> PipelineResult<Self> {
        let path = root.join(CONFIG_FILE);
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(PipelineError::Config)?;

        let settings: Settings = s.try_deserialize().map_err(PipelineError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate semantic constraints that deserialization cannot express.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.n_channels == 0 {
            return Err(PipelineError::Configuration(
                "n_channels must be positive".into(),
            ));
        }
        if self.sampling_frequency <= 0.0 {
            return Err(PipelineError::Configuration(
                "sampling_frequency must be positive".into(),
            ));
        }
        if self.raw_segment_duration_sec <= 0.0 {
            return Err(PipelineError::Configuration(
                "raw_segment_duration_sec must be positive".into(),
            ));
        }
        if self.detect_threshold_for_spike_stats >= 0.0 {
            return Err(PipelineError::Configuration(
                "detect_threshold_for_spike_stats must be negative".into(),
            ));
        }
        if self.coarse_sorting_detect_threshold >= 0.0 {
            return Err(PipelineError::Configuration(
                "coarse_sorting_detect_threshold must be negative".into(),
            ));
        }
        if self.high_activity_threshold < 0.0 {
            return Err(PipelineError::Configuration(
                "high_activity_threshold must be non-negative".into(),
            ));
        }
        let nyquist = self.sampling_frequency / 2.0;
        let f = &self.filter_params;
        if f.order == 0 {
            return Err(PipelineError::Configuration(
                "filter_params.order must be at least 1".into(),
            ));
        }
        if !(0.0 < f.lowcut && f.lowcut < f.highcut && f.highcut < nyquist) {
            return Err(PipelineError::Configuration(format!(
                "filter band ({}, {}) Hz must satisfy 0 < lowcut < highcut < {} (Nyquist)",
                f.lowcut, f.highcut, nyquist
            )));
        }
        if self.poll_interval_sec < 0.0 || self.seal_quiet_sec < 0.0 {
            return Err(PipelineError::Configuration(
                "poll_interval_sec and seal_quiet_sec must be non-negative".into(),
            ));
        }
        if self.max_concurrent_stage_tasks == 0 {
            return Err(PipelineError::Configuration(
                "max_concurrent_stage_tasks must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Number of frames in one full raw segment.
    #[must_use]
    pub fn samples_per_segment(&self) -> usize {
        (self.raw_segment_duration_sec * self.sampling_frequency).round() as usize
    }

    /// Example settings used by `init` to scaffold a new experiment.
    #[must_use]
    pub fn template() -> Self {
        Settings {
            n_channels: 512,
            sampling_frequency: 20_000.0,
            raw_segment_duration_sec: 10.0,
            filter_params: FilterParams {
                lowcut: 300.0,
                highcut: 6_000.0,
                order: 4,
            },
            detect_threshold_for_spike_stats: -40.0,
            coarse_sorting_detect_threshold: -80.0,
            high_activity_threshold: 50.0,
            poll_interval_sec: default_poll_interval_sec(),
            seal_quiet_sec: default_seal_quiet_sec(),
            max_concurrent_stage_tasks: default_max_concurrent_stage_tasks(),
            log_level: default_log_level(),
        }
    }
}

/// Electrode positions in array coordinates, one `(x, y)` pair per channel in
/// electrode-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeLayout {
    coords: Vec<(f64, f64)>,
}

impl ElectrodeLayout {
    /// Build a layout from in-memory coordinates.
    #[must_use]
    pub fn new(coords: Vec<(f64, f64)>) -> Self {
        Self { coords }
    }

    /// Load `<root>/electrode_coords.txt` and check it against the configured
    /// channel count.
    pub fn load(root: &Path, n_channels: usize) -> PipelineResult<Self> {
        let path = root.join(ELECTRODE_COORDS_FILE);
        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        if lines.len() != n_channels {
            return Err(PipelineError::Format(format!(
                "{} has {} coordinate lines, expected {}",
                path.display(),
                lines.len(),
                n_channels
            )));
        }

        let mut coords = Vec::with_capacity(n_channels);
        for (i, line) in lines.iter().enumerate() {
            let mut parts = line.split_whitespace();
            let (x, y) = match (parts.next(), parts.next(), parts.next()) {
                (Some(x), Some(y), None) => (x, y),
                _ => {
                    return Err(PipelineError::Format(format!(
                        "electrode_coords.txt line {}: expected exactly 2 values",
                        i + 1
                    )))
                }
            };
            let x: f64 = x.parse().map_err(|_| {
                PipelineError::Format(format!("electrode_coords.txt line {}: invalid number", i + 1))
            })?;
            let y: f64 = y.parse().map_err(|_| {
                PipelineError::Format(format!("electrode_coords.txt line {}: invalid number", i + 1))
            })?;
            coords.push((x, y));
        }

        Ok(Self { coords })
    }

    /// Coordinates in electrode-index order.
    #[must_use]
    pub fn coords(&self) -> &[(f64, f64)] {
        &self.coords
    }

    /// Number of electrodes in the layout.
    #[must_use]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    /// True when the layout holds no electrodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}
