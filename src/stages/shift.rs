//! Time-shift correction stage.
//!
//! Signal propagation across the array delays each electrode by an amount
//! that is, to first order, linear in its position. With fitted coefficients
//! `(c_x, c_y)`, channel `ch` at `(x, y)` is delayed by `c_x·x + c_y·y`
//! seconds; this stage advances the channel's filtered samples by that delay
//! (rounded to frames, zero fill past the edge) so that events line up
//! across channels. Requires the filtered artifact and the shift-coefficient
//! calibration.

use crate::codec::SampleBlock;
use crate::config::ElectrodeLayout;
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, SegmentRef};
use crate::reference::ShiftCoefficients;
use crate::stages::StageContext;
use crate::store::{ArtifactId, ArtifactStatus};

/// Per-channel shift in frames for the given coefficients.
#[must_use]
pub fn channel_shift_frames(
    electrodes: &ElectrodeLayout,
    sampling_frequency: f64,
    coeffs: &ShiftCoefficients,
) -> Vec<isize> {
    electrodes
        .coords()
        .iter()
        .map(|&(x, y)| {
            let delay_sec = coeffs.c_x * x + coeffs.c_y * y;
            (delay_sec * sampling_frequency).round() as isize
        })
        .collect()
}

/// Advance each channel by its shift; frames shifted in from past the edge
/// are zero.
#[must_use]
pub fn apply_shifts(block: &SampleBlock, shifts: &[isize]) -> Vec<i16> {
    let n_channels = block.n_channels;
    let num_frames = block.num_frames() as isize;
    let mut out = vec![0i16; block.data.len()];
    for (ch, &shift) in shifts.iter().enumerate().take(n_channels) {
        for t in 0..num_frames {
            let src = t + shift;
            if (0..num_frames).contains(&src) {
                out[(t as usize) * n_channels + ch] =
                    block.data[(src as usize) * n_channels + ch];
            }
        }
    }
    out
}

/// Produce the shifted artifact for one segment.
pub fn produce(segment: &SegmentRef, ctx: &StageContext) -> PipelineResult<()> {
    if ctx.store.status(&ArtifactId::ShiftCoeffs) != ArtifactStatus::Present {
        return Err(PipelineError::MissingCalibration(format!(
            "shift coefficients not ready for {segment}"
        )));
    }
    let id = ArtifactId::segment(segment.clone(), ArtifactKind::Shifted);
    let claim = ctx.store.claim(&id)?;

    let coeffs = ShiftCoefficients::load(&ctx.layout.shift_coeffs_path())?;
    let codec = ctx.codec();
    let filt_path = ctx
        .layout
        .artifact_path(segment, ArtifactKind::Filt);
    let block = codec.read_all(&filt_path)?;
    let shifts = channel_shift_frames(&ctx.electrodes, ctx.settings.sampling_frequency, &coeffs);
    let shifted = apply_shifts(&block, &shifts);

    codec.write_plain(claim.staging_path(), &shifted)?;
    claim.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_2ch() -> ElectrodeLayout {
        ElectrodeLayout::new(vec![(0.0, 0.0), (10.0, 0.0)])
    }

    #[test]
    fn shifts_follow_electrode_positions() {
        let coeffs = ShiftCoefficients {
            c_x: 0.001, // 1 ms per coordinate unit
            c_y: 0.0,
        };
        let shifts = channel_shift_frames(&layout_2ch(), 1000.0, &coeffs);
        assert_eq!(shifts, vec![0, 10]);
    }

    #[test]
    fn apply_advances_delayed_channel() {
        // channel 1 delayed by 2 frames relative to channel 0
        let mut data = vec![0i16; 10 * 2];
        data[3 * 2] = -100; // channel 0, frame 3
        data[5 * 2 + 1] = -100; // channel 1, frame 5
        let block = SampleBlock::new(data, 2).unwrap();

        let out = apply_shifts(&block, &[0, 2]);
        // channel 1's spike moves from frame 5 to frame 3
        assert_eq!(out[3 * 2], -100);
        assert_eq!(out[3 * 2 + 1], -100);
        assert_eq!(out[5 * 2 + 1], 0);
    }

    #[test]
    fn edge_frames_zero_filled() {
        let data = vec![7i16; 5];
        let block = SampleBlock::new(data, 1).unwrap();
        let out = apply_shifts(&block, &[2]);
        assert_eq!(out, vec![7, 7, 7, 0, 0]);

        let block = SampleBlock::new(vec![7i16; 5], 1).unwrap();
        let out = apply_shifts(&block, &[-2]);
        assert_eq!(out, vec![0, 0, 7, 7, 7]);
    }

    #[test]
    fn zero_coefficients_are_identity() {
        let data: Vec<i16> = (0..20).collect();
        let block = SampleBlock::new(data.clone(), 2).unwrap();
        let shifts = channel_shift_frames(
            &layout_2ch(),
            1000.0,
            &ShiftCoefficients { c_x: 0.0, c_y: 0.0 },
        );
        assert_eq!(apply_shifts(&block, &shifts), data);
    }
}
