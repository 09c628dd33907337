//! Windowed trough detection shared by the statistics, high-activity, and
//! sorting stages.
//!
//! Spikes are negative deflections: a sample is a detected trough when it is
//! at or below the (negative) threshold and is the minimum of its
//! surrounding window. Ties inside a window resolve to the earliest sample,
//! so a plateau yields exactly one detection.

/// Half-width, in frames, of the local-minimum window.
pub const TROUGH_WINDOW: usize = 10;

/// Indices of detected troughs in `samples`.
#[must_use]
pub fn detect_troughs(samples: &[f64], threshold: f64) -> Vec<usize> {
    let mut troughs = Vec::new();
    let len = samples.len();
    for i in 0..len {
        let s = samples[i];
        if s > threshold {
            continue;
        }
        let lo = i.saturating_sub(TROUGH_WINDOW);
        let hi = (i + TROUGH_WINDOW + 1).min(len);
        let before_ok = samples[lo..i].iter().all(|&v| v > s);
        let after_ok = samples[i + 1..hi].iter().all(|&v| v >= s);
        if before_ok && after_ok {
            troughs.push(i);
        }
    }
    troughs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_trough_detected() {
        let mut samples = vec![0.0; 1000];
        samples[500] = -50.0;
        assert_eq!(detect_troughs(&samples, -40.0), vec![500]);
    }

    #[test]
    fn sub_threshold_deflection_ignored() {
        let mut samples = vec![0.0; 100];
        samples[50] = -30.0;
        assert!(detect_troughs(&samples, -40.0).is_empty());
    }

    #[test]
    fn nearby_samples_of_one_spike_count_once() {
        let mut samples = vec![0.0; 100];
        // one spike with a shoulder
        samples[50] = -60.0;
        samples[51] = -55.0;
        samples[52] = -45.0;
        assert_eq!(detect_troughs(&samples, -40.0), vec![50]);
    }

    #[test]
    fn plateau_resolves_to_earliest_sample() {
        let mut samples = vec![0.0; 100];
        samples[40] = -60.0;
        samples[41] = -60.0;
        assert_eq!(detect_troughs(&samples, -40.0), vec![40]);
    }

    #[test]
    fn well_separated_spikes_all_detected() {
        let mut samples = vec![0.0; 200];
        samples[20] = -80.0;
        samples[100] = -90.0;
        samples[180] = -70.0;
        assert_eq!(detect_troughs(&samples, -40.0), vec![20, 100, 180]);
    }

    #[test]
    fn trough_at_edges_detected() {
        let mut samples = vec![0.0; 50];
        samples[0] = -50.0;
        samples[49] = -60.0;
        assert_eq!(detect_troughs(&samples, -40.0), vec![0, 49]);
    }
}
