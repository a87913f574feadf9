//! Fixed-length framing for the neural path and the overlap-add that puts
//! processed frames back together.

use crate::{analysis::hann_value, audio, LofiError, Result};

/// Window sums below this are treated as uncovered when normalising.
const WINDOW_FLOOR: f32 = 1e-3;

/// One fixed-length slice of a waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Offset of the first sample in the source waveform.
    pub start: usize,
    /// Exactly `segment_length` samples; the tail is zero padded.
    pub samples: Vec<f32>,
}

/// Splits waveforms into overlapping windows of `segment_length` samples.
///
/// Higher overlap means more segments for the same audio. Past roughly
/// 0.5 the extra compute buys little audible smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segmenter {
    segment_length: usize,
    hop: usize,
}

impl Segmenter {
    pub fn new(segment_length: usize, overlap: f64) -> Result<Self> {
        if segment_length == 0 {
            return Err(LofiError::input("segmenter", "segment length must be positive"));
        }
        if !(0.0..1.0).contains(&overlap) {
            return Err(LofiError::input(
                "segmenter",
                format!("overlap must be in [0, 1), got {overlap}"),
            ));
        }
        let hop = (segment_length as f64 * (1.0 - overlap)) as usize;
        Ok(Self {
            segment_length,
            hop: hop.max(1),
        })
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// `ceil((len - L) / hop) + 1`, and 1 for anything no longer than `L`.
    pub fn segment_count(&self, len: usize) -> usize {
        if len <= self.segment_length {
            return 1;
        }
        (len - self.segment_length).div_ceil(self.hop) + 1
    }

    pub fn segment(&self, waveform: &[f32]) -> Vec<Segment> {
        let count = self.segment_count(waveform.len());
        (0..count)
            .map(|i| {
                let start = i * self.hop;
                let end = (start + self.segment_length).min(waveform.len());
                let mut samples = Vec::with_capacity(self.segment_length);
                if start < end {
                    samples.extend_from_slice(&waveform[start..end]);
                }
                samples.resize(self.segment_length, 0.0);
                Segment { start, samples }
            })
            .collect()
    }

    pub fn reconstruct(&self, segments: &[Vec<f32>], original_length: usize) -> Result<Vec<f32>> {
        reconstruct(segments, original_length, self.segment_length, self.hop)
    }
}

/// Windowed overlap-add of processed segments.
///
/// Segment `i` is Hann weighted and summed in at `i * hop`, truncated at
/// `original_length`. The sum is then divided by the accumulated window
/// weight so that any window/hop pair gives a flat envelope. Samples the
/// window barely covers (the edges of the first and last segment, or every
/// segment boundary when the hop equals the length) fall back to the plain
/// average of the unweighted contributions. The result is peak normalised.
pub fn reconstruct(
    segments: &[Vec<f32>],
    original_length: usize,
    segment_length: usize,
    hop: usize,
) -> Result<Vec<f32>> {
    if segment_length == 0 || hop == 0 {
        return Err(LofiError::input(
            "reconstructor",
            format!("segment length {segment_length} and hop {hop} must be positive"),
        ));
    }
    if let Some((index, bad)) = segments
        .iter()
        .enumerate()
        .find(|(_, s)| s.len() != segment_length)
    {
        return Err(LofiError::input(
            "reconstructor",
            format!(
                "segment {index} has {} samples, expected {segment_length}",
                bad.len()
            ),
        ));
    }

    let window: Vec<f32> = (0..segment_length)
        .map(|n| hann_value(n, segment_length))
        .collect();
    let mut weighted = vec![0.0f32; original_length];
    let mut weight = vec![0.0f32; original_length];
    let mut raw = vec![0.0f32; original_length];
    let mut hits = vec![0u32; original_length];

    for (i, segment) in segments.iter().enumerate() {
        let offset = i * hop;
        if offset >= original_length {
            break;
        }
        let span = segment_length.min(original_length - offset);
        for n in 0..span {
            let t = offset + n;
            weighted[t] += segment[n] * window[n];
            weight[t] += window[n];
            raw[t] += segment[n];
            hits[t] += 1;
        }
    }

    let mut output: Vec<f32> = (0..original_length)
        .map(|t| {
            if weight[t] > WINDOW_FLOOR {
                weighted[t] / weight[t]
            } else if hits[t] > 0 {
                raw[t] / hits[t] as f32
            } else {
                0.0
            }
        })
        .collect();

    audio::peak_normalize(&mut output);
    tracing::debug!(
        segments = segments.len(),
        samples = original_length,
        hop,
        "overlap-add reconstruction"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i as f32) * 0.013).sin() * 0.8).collect()
    }

    #[test]
    fn documented_segment_count() {
        let segmenter = Segmenter::new(22_050, 0.1).unwrap();
        assert_eq!(segmenter.hop(), 19_845);
        let segments = segmenter.segment(&vec![0.1; 100_000]);
        assert_eq!(segments.len(), 5);
        assert!(segments.iter().all(|s| s.samples.len() == 22_050));
        let last = segments.last().unwrap();
        assert_eq!(last.start, 4 * 19_845);
        // 100000 - 79380 = 20620 real samples, the rest padding.
        assert_eq!(last.samples[20_619], 0.1);
        assert_eq!(last.samples[20_620], 0.0);
    }

    #[test]
    fn short_waveform_is_one_padded_segment() {
        let segmenter = Segmenter::new(1_000, 0.25).unwrap();
        let input = ramp(300);
        let segments = segmenter.segment(&input);
        assert_eq!(segments.len(), 1);
        assert_eq!(&segments[0].samples[..300], &input[..]);
        assert!(segments[0].samples[300..].iter().all(|&s| s == 0.0));

        let processed: Vec<Vec<f32>> = segments.into_iter().map(|s| s.samples).collect();
        let out = segmenter.reconstruct(&processed, 300).unwrap();
        assert_eq!(out.len(), 300);
    }

    #[test]
    fn identity_round_trip_without_overlap() {
        let segmenter = Segmenter::new(512, 0.0).unwrap();
        let input = ramp(2_000);
        let processed: Vec<Vec<f32>> = segmenter
            .segment(&input)
            .into_iter()
            .map(|s| s.samples)
            .collect();
        let out = segmenter.reconstruct(&processed, input.len()).unwrap();
        assert_eq!(out.len(), input.len());
        for (a, b) in out.iter().zip(&input) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn identity_round_trip_with_overlap_is_flat() {
        let segmenter = Segmenter::new(400, 0.5).unwrap();
        let input = ramp(3_000);
        let processed: Vec<Vec<f32>> = segmenter
            .segment(&input)
            .into_iter()
            .map(|s| s.samples)
            .collect();
        let out = segmenter.reconstruct(&processed, input.len()).unwrap();
        for (a, b) in out.iter().zip(&input) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn constant_segments_reconstruct_without_ripple() {
        let out = reconstruct(&vec![vec![0.5; 100]; 6], 400, 100, 63).unwrap();
        for value in &out {
            assert_abs_diff_eq!(*value, 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn output_is_peak_normalised() {
        let out = reconstruct(&[vec![3.0; 16]], 16, 16, 16).unwrap();
        assert!(out.iter().all(|v| v.abs() <= 1.0 + 1e-6));
        assert_abs_diff_eq!(audio::peak(&out), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Segmenter::new(100, 1.0).is_err());
        assert!(Segmenter::new(100, -0.1).is_err());
        assert!(Segmenter::new(0, 0.1).is_err());
        assert!(reconstruct(&[vec![0.0; 10]], 10, 12, 6).is_err());
    }

    #[test]
    fn extreme_overlap_still_advances() {
        let segmenter = Segmenter::new(10, 0.99).unwrap();
        assert_eq!(segmenter.hop(), 1);
        assert_eq!(segmenter.segment_count(20), 11);
    }
}
