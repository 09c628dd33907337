//! Band-pass filtering stage.
//!
//! Applies a per-channel zero-phase Butterworth band-pass to a raw segment.
//! The band-pass is realized as a cascade of biquad sections: a high-pass at
//! `lowcut` and a low-pass at `highcut`, ⌈order/2⌉ sections each, run
//! forward and then backward over the channel (filtfilt), which cancels the
//! cascade's phase delay. Output has the same shape and sample format as the
//! input.

use crate::codec::SampleBlock;
use crate::config::FilterParams;
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, SegmentRef};
use crate::stages::StageContext;
use crate::store::ArtifactId;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Q_BUTTERWORTH_F64};

/// Designed biquad cascade for one band-pass configuration.
#[derive(Debug, Clone)]
pub struct BandpassDesign {
    sections: Vec<Coefficients<f64>>,
}

impl BandpassDesign {
    /// Design the cascade for the given parameters and sampling frequency.
    pub fn new(params: &FilterParams, fs: f64) -> PipelineResult<Self> {
        let n_sections = params.order.div_ceil(2).max(1);
        let mut sections = Vec::with_capacity(n_sections * 2);
        for _ in 0..n_sections {
            let hp = Coefficients::<f64>::from_params(
                biquad::Type::HighPass,
                fs.hz(),
                params.lowcut.hz(),
                Q_BUTTERWORTH_F64,
            )
            .map_err(|e| {
                PipelineError::StageCompute(format!(
                    "high-pass design failed at {} Hz: {e:?}",
                    params.lowcut
                ))
            })?;
            let lp = Coefficients::<f64>::from_params(
                biquad::Type::LowPass,
                fs.hz(),
                params.highcut.hz(),
                Q_BUTTERWORTH_F64,
            )
            .map_err(|e| {
                PipelineError::StageCompute(format!(
                    "low-pass design failed at {} Hz: {e:?}",
                    params.highcut
                ))
            })?;
            sections.push(hp);
            sections.push(lp);
        }
        Ok(Self { sections })
    }

    fn run_once(&self, samples: &mut [f64]) {
        let mut filters: Vec<DirectForm2Transposed<f64>> = self
            .sections
            .iter()
            .map(|c| DirectForm2Transposed::<f64>::new(*c))
            .collect();
        for s in samples.iter_mut() {
            let mut v = *s;
            for f in &mut filters {
                v = f.run(v);
            }
            *s = v;
        }
    }

    /// Zero-phase filtering: forward pass, then a backward pass with fresh
    /// filter state.
    pub fn filtfilt(&self, samples: &mut [f64]) {
        self.run_once(samples);
        samples.reverse();
        self.run_once(samples);
        samples.reverse();
    }
}

/// Filter a whole block channel by channel, returning frame-major i16 output.
pub fn filter_block(block: &SampleBlock, design: &BandpassDesign) -> Vec<i16> {
    let n_channels = block.n_channels;
    let num_frames = block.num_frames();
    let mut out = vec![0i16; block.data.len()];
    for ch in 0..n_channels {
        let mut samples = block.channel_f64(ch);
        design.filtfilt(&mut samples);
        for (t, v) in samples.iter().enumerate().take(num_frames) {
            out[t * n_channels + ch] =
                v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        }
    }
    out
}

/// Produce the filtered artifact for one raw segment.
pub fn produce(segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
    let id = ArtifactId::segment(segment.clone(), ArtifactKind::Filt);
    let claim = ctx.store.claim(&id)?;

    let codec = ctx.codec();
    let block = codec.read_all(&ctx.layout.raw_segment_path(segment))?;
    let design = BandpassDesign::new(&ctx.settings.filter_params, ctx.settings.sampling_frequency)?;
    let filtered = filter_block(&block, &design);

    codec.write_plain(claim.staging_path(), &filtered)?;
    claim.commit()
}
