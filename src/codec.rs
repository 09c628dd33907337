//! Fixed-layout binary segment codec.
//!
//! A segment file is a flat sequence of 16-bit signed little-endian samples in
//! frame-major order: per frame, all channel samples in electrode-index order.
//! The file size must equal `num_frames × num_channels × 2` bytes exactly;
//! anything else is a format error. This convention is fixed here and used by
//! every stage.
//!
//! Reads come in two flavors: whole-segment reads are memory-mapped, and
//! arbitrary frame ranges are served with a seek so a 10-second window of a
//! long segment never loads the rest of the file. Writes stage into a
//! temporary sibling path and become visible only through an atomic rename,
//! so a concurrent reader never observes a partially written segment.

use crate::error::{PipelineError, PipelineResult};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Bytes per sample (i16).
pub const BYTES_PER_SAMPLE: usize = 2;

/// A decoded multi-channel sample block in frame-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBlock {
    /// Frame-major samples, `num_frames × n_channels` entries.
    pub data: Vec<i16>,
    /// Channels per frame.
    pub n_channels: usize,
}

impl SampleBlock {
    /// Wrap frame-major samples; the length must be a whole number of frames.
    pub fn new(data: Vec<i16>, n_channels: usize) -> PipelineResult<Self> {
        if n_channels == 0 || data.len() % n_channels != 0 {
            return Err(PipelineError::Format(format!(
                "{} samples do not form whole frames of {} channels",
                data.len(),
                n_channels
            )));
        }
        Ok(Self { data, n_channels })
    }

    /// Number of frames in the block.
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.data.len() / self.n_channels
    }

    /// One frame as a channel-indexed slice.
    #[must_use]
    pub fn frame(&self, index: usize) -> &[i16] {
        let start = index * self.n_channels;
        &self.data[start..start + self.n_channels]
    }

    /// One channel's samples as an owned `f64` vector.
    #[must_use]
    pub fn channel_f64(&self, channel: usize) -> Vec<f64> {
        self.data
            .iter()
            .skip(channel)
            .step_by(self.n_channels)
            .map(|&s| f64::from(s))
            .collect()
    }

    /// Per-frame minimum across channels, as `f64`.
    #[must_use]
    pub fn frame_min_f64(&self) -> Vec<f64> {
        (0..self.num_frames())
            .map(|i| {
                self.frame(i)
                    .iter()
                    .copied()
                    .min()
                    .map_or(0.0, f64::from)
            })
            .collect()
    }
}

/// Reader/writer for fixed-layout segment files.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCodec {
    n_channels: usize,
    sampling_frequency: f64,
}

impl SegmentCodec {
    /// Codec for the configured channel count and sampling frequency.
    #[must_use]
    pub fn new(n_channels: usize, sampling_frequency: f64) -> Self {
        Self {
            n_channels,
            sampling_frequency,
        }
    }

    /// Channels per frame.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Bytes occupied by one frame.
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        self.n_channels * BYTES_PER_SAMPLE
    }

    /// Convert a time in seconds to a frame index (truncating).
    #[must_use]
    pub fn sec_to_frame(&self, sec: f64) -> usize {
        (sec * self.sampling_frequency).max(0.0) as usize
    }

    /// Frame count of a segment file, validating the exact-size contract.
    pub fn frame_count(&self, path: &Path) -> PipelineResult<usize> {
        let len = std::fs::metadata(path)?.len() as usize;
        self.frames_from_bytes(len, path)
    }

    fn frames_from_bytes(&self, len: usize, path: &Path) -> PipelineResult<usize> {
        let bpf = self.bytes_per_frame();
        if len % bpf != 0 {
            return Err(PipelineError::Format(format!(
                "{}: {} bytes is not a multiple of {} ({} channels × {} bytes)",
                path.display(),
                len,
                bpf,
                self.n_channels,
                BYTES_PER_SAMPLE
            )));
        }
        Ok(len / bpf)
    }

    /// Read a whole segment via memory mapping.
    pub fn read_all(&self, path: &Path) -> PipelineResult<SampleBlock> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and segment files are immutable
        // once visible (writes happen to a staging path and are renamed in).
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        self.frames_from_bytes(mmap.len(), path)?;
        Ok(SampleBlock {
            data: decode_samples(&mmap),
            n_channels: self.n_channels,
        })
    }

    /// Read the frame range `[start, end)` without loading the whole file.
    pub fn read_frames(&self, path: &Path, start: usize, end: usize) -> PipelineResult<SampleBlock> {
        let total = self.frame_count(path)?;
        if start > end || end > total {
            return Err(PipelineError::Format(format!(
                "{}: frame range [{start}, {end}) outside 0..{total}",
                path.display()
            )));
        }
        let bpf = self.bytes_per_frame();
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start((start * bpf) as u64))?;
        let mut buf = vec![0u8; (end - start) * bpf];
        file.read_exact(&mut buf)?;
        Ok(SampleBlock {
            data: decode_samples(&buf),
            n_channels: self.n_channels,
        })
    }

    /// Read the time range `[start_sec, end_sec)`, clamped to the file length.
    pub fn read_seconds(
        &self,
        path: &Path,
        start_sec: f64,
        end_sec: f64,
    ) -> PipelineResult<SampleBlock> {
        let total = self.frame_count(path)?;
        let start = self.sec_to_frame(start_sec).min(total);
        let end = self.sec_to_frame(end_sec).clamp(start, total);
        self.read_frames(path, start, end)
    }

    /// Write frame-major samples directly to `path` with no rename step.
    ///
    /// Used for targets that are already staging paths handed out by the
    /// artifact store; visibility is then the store's commit rename.
    pub fn write_plain(&self, path: &Path, samples: &[i16]) -> PipelineResult<()> {
        if samples.len() % self.n_channels != 0 {
            return Err(PipelineError::Format(format!(
                "{}: {} samples do not form whole frames of {} channels",
                path.display(),
                samples.len(),
                self.n_channels
            )));
        }
        let mut file = File::create(path)?;
        file.write_all(&encode_samples(samples))?;
        file.sync_all()?;
        Ok(())
    }

    /// Write frame-major samples through a staging path and an atomic rename.
    pub fn write_atomic(&self, path: &Path, samples: &[i16]) -> PipelineResult<()> {
        if samples.len() % self.n_channels != 0 {
            return Err(PipelineError::Format(format!(
                "{}: {} samples do not form whole frames of {} channels",
                path.display(),
                samples.len(),
                self.n_channels
            )));
        }
        let staging = staging_path(path);
        if let Some(parent) = staging.parent() {
            std::fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&staging)?;
            file.write_all(&encode_samples(samples))?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, path)?;
        Ok(())
    }
}

/// Unique staging sibling for `path`, on the same filesystem so the final
/// rename is atomic.
#[must_use]
pub fn staging_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

fn decode_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SegmentCodec {
        SegmentCodec::new(4, 1000.0)
    }

    #[test]
    fn write_then_read_round_trip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<i16> = (0..4000).map(|_| rng.gen_range(i16::MIN..=i16::MAX)).collect();

        codec().write_atomic(&path, &samples).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8000);

        let block = codec().read_all(&path).unwrap();
        assert_eq!(block.num_frames(), 1000);
        assert_eq!(block.data, samples);
    }

    #[test]
    fn truncated_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        std::fs::write(&path, vec![0u8; 8001]).unwrap();
        assert!(matches!(
            codec().read_all(&path),
            Err(PipelineError::Format(_))
        ));
        assert!(matches!(
            codec().frame_count(&path),
            Err(PipelineError::Format(_))
        ));
    }

    #[test]
    fn frame_range_read_matches_whole_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        let samples: Vec<i16> = (0..4000).map(|i| i as i16).collect();
        codec().write_atomic(&path, &samples).unwrap();

        let window = codec().read_frames(&path, 250, 750).unwrap();
        assert_eq!(window.num_frames(), 500);
        assert_eq!(window.frame(0), &samples[250 * 4..250 * 4 + 4]);

        let by_time = codec().read_seconds(&path, 0.25, 0.75).unwrap();
        assert_eq!(by_time, window);
    }

    #[test]
    fn out_of_range_read_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        codec().write_atomic(&path, &vec![0i16; 400]).unwrap();
        assert!(codec().read_frames(&path, 0, 101).is_err());
    }

    #[test]
    fn seconds_read_clamps_to_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        codec().write_atomic(&path, &vec![7i16; 400]).unwrap();
        let block = codec().read_seconds(&path, 0.05, 10.0).unwrap();
        assert_eq!(block.num_frames(), 50);
    }

    #[test]
    fn no_staging_leftovers_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        codec().write_atomic(&path, &vec![1i16; 40]).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["segment_001.bin".to_string()]);
    }

    #[test]
    fn channel_views() {
        let block = SampleBlock::new(vec![1, 2, 3, 4, 5, 6], 3).unwrap();
        assert_eq!(block.num_frames(), 2);
        assert_eq!(block.channel_f64(1), vec![2.0, 5.0]);
        assert_eq!(block.frame_min_f64(), vec![1.0, 4.0]);
        assert!(SampleBlock::new(vec![1, 2, 3], 2).is_err());
    }
}
