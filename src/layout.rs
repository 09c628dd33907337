//! Experiment directory layout and artifact naming.
//!
//! The on-disk tree is the external contract of the pipeline and is
//! reproduced name-for-name:
//!
//! ```text
//! acquisition/<epoch_block>/              raw input (external)
//! raw/<epoch_block>/segment_NNN.bin       fixed-layout int16 frame-major samples
//! computed/filt/<eb>/segment_NNN.bin.filt
//! computed/shifted/<eb>/segment_NNN.bin.shifted
//! computed/stats/<eb>/segment_NNN.bin.stats.json
//! computed/high_activity/<eb>/segment_NNN.bin.high_activity.json
//! computed/reference_sorting/<eb>/segment_NNN.bin/{spike_times,...}
//! computed/shift_coeffs.yaml
//! reference_segment.txt
//! ```
//!
//! Everything that needs a path goes through [`ExperimentLayout`] so the
//! naming scheme lives in exactly one place.

use crate::error::{PipelineError, PipelineResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// File holding the reference segment pointer, relative to the root.
pub const REFERENCE_POINTER_FILE: &str = "reference_segment.txt";

/// A raw segment, identified by its epoch block and file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentRef {
    /// Name of the epoch block directory, e.g. `epoch_block_001`.
    pub epoch_block: String,
    /// Segment file name, e.g. `segment_002.bin`.
    pub filename: String,
}

impl SegmentRef {
    /// Build a reference from an epoch block name and a 1-based segment index.
    #[must_use]
    pub fn from_index(epoch_block: &str, index: usize) -> Self {
        Self {
            epoch_block: epoch_block.to_string(),
            filename: segment_filename(index),
        }
    }

    /// Parse a `<epoch_block>/<segment_filename>` pointer string.
    pub fn parse(value: &str) -> PipelineResult<Self> {
        let mut parts = value.trim().splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(eb), Some(seg)) if !eb.is_empty() && seg.ends_with(".bin") => Ok(Self {
                epoch_block: eb.to_string(),
                filename: seg.to_string(),
            }),
            _ => Err(PipelineError::Format(format!(
                "invalid segment reference '{value}', expected <epoch_block>/<segment>.bin"
            ))),
        }
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.epoch_block, self.filename)
    }
}

/// Segment file name for a 1-based index, zero-padded to three digits.
#[must_use]
pub fn segment_filename(index: usize) -> String {
    format!("segment_{index:03}.bin")
}

/// Parse the 1-based index out of a `segment_NNN.bin` file name.
#[must_use]
pub fn parse_segment_index(filename: &str) -> Option<usize> {
    let digits = filename.strip_prefix("segment_")?.strip_suffix(".bin")?;
    digits.parse().ok()
}

/// Per-segment artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Band-pass filtered segment (`.filt`, binary).
    Filt,
    /// Per-channel spike statistics (`.stats.json`).
    Stats,
    /// High-activity intervals (`.high_activity.json`).
    HighActivity,
    /// Time-shift-corrected segment (`.shifted`, binary).
    Shifted,
    /// Reference-anchored sorting result (directory of numeric arrays).
    ReferenceSorting,
}

impl ArtifactKind {
    /// All per-segment kinds, in dependency-friendly order.
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Filt,
        ArtifactKind::Stats,
        ArtifactKind::HighActivity,
        ArtifactKind::Shifted,
        ArtifactKind::ReferenceSorting,
    ];

    /// Directory under `computed/` that holds this kind.
    #[must_use]
    pub fn subdir(self) -> &'static str {
        match self {
            ArtifactKind::Filt => "filt",
            ArtifactKind::Stats => "stats",
            ArtifactKind::HighActivity => "high_activity",
            ArtifactKind::Shifted => "shifted",
            ArtifactKind::ReferenceSorting => "reference_sorting",
        }
    }

    /// Artifact file (or directory) name for the given segment file name.
    #[must_use]
    pub fn artifact_name(self, segment_filename: &str) -> String {
        match self {
            ArtifactKind::Filt => format!("{segment_filename}.filt"),
            ArtifactKind::Stats => format!("{segment_filename}.stats.json"),
            ArtifactKind::HighActivity => format!("{segment_filename}.high_activity.json"),
            ArtifactKind::Shifted => format!("{segment_filename}.shifted"),
            ArtifactKind::ReferenceSorting => segment_filename.to_string(),
        }
    }

    /// True when the artifact is a directory of files rather than one file.
    #[must_use]
    pub fn is_directory(self) -> bool {
        matches!(self, ArtifactKind::ReferenceSorting)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subdir())
    }
}

/// File names inside a reference-sorting artifact directory.
pub const SORTING_FILES: [&str; 4] = [
    "spike_times",
    "spike_labels",
    "spike_amplitudes",
    "templates",
];

/// Resolves every path in the experiment tree.
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    /// Layout rooted at the experiment directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Experiment root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `acquisition/`: external raw input.
    #[must_use]
    pub fn acquisition_dir(&self) -> PathBuf {
        self.root.join("acquisition")
    }

    /// `raw/`: rechunked segments.
    #[must_use]
    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    /// `computed/`: derived artifacts.
    #[must_use]
    pub fn computed_dir(&self) -> PathBuf {
        self.root.join("computed")
    }

    /// `acquisition/<epoch_block>/`.
    #[must_use]
    pub fn acquisition_block_dir(&self, epoch_block: &str) -> PathBuf {
        self.acquisition_dir().join(epoch_block)
    }

    /// `raw/<epoch_block>/`.
    #[must_use]
    pub fn raw_block_dir(&self, epoch_block: &str) -> PathBuf {
        self.raw_dir().join(epoch_block)
    }

    /// `raw/<epoch_block>/segment_NNN.bin`.
    #[must_use]
    pub fn raw_segment_path(&self, segment: &SegmentRef) -> PathBuf {
        self.raw_block_dir(&segment.epoch_block).join(&segment.filename)
    }

    /// Final path of a per-segment artifact.
    #[must_use]
    pub fn artifact_path(&self, segment: &SegmentRef, kind: ArtifactKind) -> PathBuf {
        self.computed_dir()
            .join(kind.subdir())
            .join(&segment.epoch_block)
            .join(kind.artifact_name(&segment.filename))
    }

    /// `computed/shift_coeffs.yaml`.
    #[must_use]
    pub fn shift_coeffs_path(&self) -> PathBuf {
        self.computed_dir().join("shift_coeffs.yaml")
    }

    /// `reference_segment.txt`.
    #[must_use]
    pub fn reference_pointer_path(&self) -> PathBuf {
        self.root.join(REFERENCE_POINTER_FILE)
    }

    /// All raw segments currently on disk, in (epoch block, index) order.
    pub fn scan_raw_segments(&self) -> PipelineResult<Vec<SegmentRef>> {
        let raw = self.raw_dir();
        if !raw.is_dir() {
            return Ok(Vec::new());
        }

        let mut blocks: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&raw)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                blocks.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        blocks.sort();

        let mut segments = Vec::new();
        for block in blocks {
            let mut names: Vec<String> = Vec::new();
            for entry in std::fs::read_dir(self.raw_block_dir(&block))? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if parse_segment_index(&name).is_some() {
                    names.push(name);
                }
            }
            names.sort();
            segments.extend(names.into_iter().map(|filename| SegmentRef {
                epoch_block: block.clone(),
                filename,
            }));
        }
        Ok(segments)
    }
}
