//! Segment rechunker.
//!
//! Splits a sealed epoch block's raw byte stream into fixed-duration raw
//! segments. The block's `.bin` files (name-sorted) are treated as one
//! concatenated frame-major sample stream; windows of
//! `raw_segment_duration_sec × sampling_frequency` frames become
//! `raw/<epoch_block>/segment_NNN.bin`, written through the codec's atomic
//! path. Segments already on disk are never re-chunked: repeated cycles (and
//! restarts after a crash) only append what is missing. The final segment,
//! carrying whatever remainder of frames exists, is emitted exactly once; it
//! can never be wrong about its length because only sealed blocks reach this
//! component.

use crate::codec::{SegmentCodec, BYTES_PER_SAMPLE};
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{segment_filename, ExperimentLayout};
use crate::monitor::SealedBlock;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info};

/// Rechunks sealed epoch blocks into raw segments.
#[derive(Debug)]
pub struct SegmentRechunker {
    layout: ExperimentLayout,
    codec: SegmentCodec,
    samples_per_segment: usize,
}

impl SegmentRechunker {
    /// Rechunker for the given layout and segment length (in frames).
    #[must_use]
    pub fn new(layout: ExperimentLayout, codec: SegmentCodec, samples_per_segment: usize) -> Self {
        Self {
            layout,
            codec,
            samples_per_segment,
        }
    }

    /// Emit every missing segment of a sealed block. Returns how many
    /// segments were newly written.
    pub fn rechunk(&self, block: &SealedBlock) -> PipelineResult<usize> {
        let source = SourceStream::open(&self.layout, &block.name)?;
        let bpf = self.codec.bytes_per_frame();
        if source.total_bytes % bpf as u64 != 0 {
            return Err(PipelineError::Format(format!(
                "epoch block {}: {} payload bytes is not a multiple of the {}-byte frame size",
                block.name, source.total_bytes, bpf
            )));
        }
        let total_frames = (source.total_bytes / bpf as u64) as usize;
        if total_frames == 0 {
            return Ok(0);
        }

        let s = self.samples_per_segment;
        let expected = total_frames.div_ceil(s);
        let block_dir = self.layout.raw_block_dir(&block.name);

        let mut written = 0;
        for index in 1..=expected {
            let path = block_dir.join(segment_filename(index));
            if path.exists() {
                continue;
            }
            let start = (index - 1) * s;
            let end = (start + s).min(total_frames);
            let bytes = source.read_bytes((start * bpf) as u64, (end - start) * bpf)?;
            let samples: Vec<i16> = bytes
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            self.codec.write_atomic(&path, &samples)?;
            debug!(
                epoch_block = %block.name,
                segment = index,
                frames = end - start,
                "wrote raw segment"
            );
            written += 1;
        }

        if written > 0 {
            info!(
                epoch_block = %block.name,
                new_segments = written,
                total_segments = expected,
                "rechunked epoch block"
            );
        }
        Ok(written)
    }
}

/// The name-sorted `.bin` files of one epoch block, viewed as a single
/// contiguous byte stream.
struct SourceStream {
    files: Vec<(PathBuf, u64)>,
    total_bytes: u64,
}

impl SourceStream {
    fn open(layout: &ExperimentLayout, epoch_block: &str) -> PipelineResult<Self> {
        let dir = layout.acquisition_block_dir(epoch_block);
        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && name.ends_with(".bin") {
                names.push(name);
            }
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        let mut total_bytes = 0u64;
        for name in names {
            let path = dir.join(name);
            let len = std::fs::metadata(&path)?.len();
            total_bytes += len;
            files.push((path, len));
        }
        Ok(Self { files, total_bytes })
    }

    /// Read `len` bytes at global offset `start`, crossing file boundaries as
    /// needed.
    fn read_bytes(&self, start: u64, len: usize) -> PipelineResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut filled = 0usize;
        let mut file_start = 0u64;
        for (path, file_len) in &self.files {
            let file_end = file_start + file_len;
            let want_start = start + filled as u64;
            if filled < len && want_start < file_end && want_start >= file_start {
                let within = want_start - file_start;
                let take = ((file_len - within) as usize).min(len - filled);
                let mut f = File::open(path)?;
                f.seek(SeekFrom::Start(within))?;
                f.read_exact(&mut out[filled..filled + take])?;
                filled += take;
            }
            file_start = file_end;
            if filled == len {
                break;
            }
        }
        if filled != len {
            return Err(PipelineError::Format(format!(
                "source stream ended {} bytes short of requested range",
                len - filled
            )));
        }
        Ok(out)
    }
}
