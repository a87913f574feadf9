//! Whole-clip feature extraction.
//!
//! The extractor runs a short-time Fourier transform over the entire
//! waveform and reduces every per-frame statistic to clip-level means and
//! standard deviations. The output schema is fixed; its order is the order
//! in which the values are fed to the neural conditioning path.

use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::{LofiError, Result};

pub const FRAME_SIZE: usize = 2048;
pub const HOP_SIZE: usize = 512;
pub const N_MELS: usize = 128;
pub const N_MFCC: usize = 13;
const ROLLOFF_PERCENT: f32 = 0.85;
const CONTRAST_QUANTILE: f32 = 0.02;
const CONTRAST_FMIN: f32 = 200.0;
const CONTRAST_BANDS: usize = 6;
const MIN_BPM: f32 = 30.0;
const MAX_BPM: f32 = 240.0;
const PRIOR_BPM: f32 = 120.0;
const FALLBACK_BPM: f32 = 120.0;
const POWER_FLOOR: f32 = 1e-10;

/// Number of values produced by [`FeatureExtractor::extract`].
pub const FEATURE_COUNT: usize = 9 + 2 * N_MFCC + 1;

/// Ordered set of named clip-level features.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVector {
    entries: Vec<(String, f32)>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: f32) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    /// Looks up a feature that the schema guarantees, failing with an input
    /// error when it is absent.
    pub fn require(&self, name: &str) -> Result<f32> {
        self.get(name).ok_or_else(|| {
            LofiError::input("features", format!("feature `{name}` is missing"))
        })
    }

    /// Values in schema order, ready to be used as a model input.
    pub fn values(&self) -> Vec<f32> {
        self.entries.iter().map(|(_, value)| *value).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.entries.iter().all(|(_, value)| value.is_finite())
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Computes the fixed feature schema over a whole waveform.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extracts the clip-level features of `waveform`.
    ///
    /// Silence yields zeros (and the fallback tempo) rather than errors.
    pub fn extract(&self, waveform: &[f32], sample_rate: u32) -> Result<FeatureVector> {
        if waveform.is_empty() {
            return Err(LofiError::input(
                "feature extraction",
                "waveform must contain at least one sample",
            ));
        }
        if sample_rate == 0 {
            return Err(LofiError::input(
                "feature extraction",
                "sample rate must be positive",
            ));
        }
        if waveform.iter().any(|s| !s.is_finite()) {
            return Err(LofiError::input(
                "feature extraction",
                format!("waveform of {} samples contains non-finite values", waveform.len()),
            ));
        }

        let frames = FrameStats::collect(waveform, sample_rate)?;
        let features = frames.summarize(sample_rate);

        if !features.is_finite() {
            return Err(LofiError::unstable(
                "feature extraction",
                format!("non-finite feature for {} samples", waveform.len()),
            ));
        }

        tracing::debug!(
            samples = waveform.len(),
            frames = frames.rms.len(),
            tempo = features.get("tempo").unwrap_or_default(),
            "extracted features"
        );
        Ok(features)
    }
}

/// Per-frame statistics accumulated over the STFT.
struct FrameStats {
    centroid: Vec<f32>,
    bandwidth: Vec<f32>,
    rolloff: Vec<f32>,
    zcr: Vec<f32>,
    rms: Vec<f32>,
    contrast: Vec<f32>,
    chroma: Vec<f32>,
    onset: Vec<f32>,
    /// `N_MFCC` rows, one value per frame.
    mfcc: Vec<Vec<f32>>,
}

impl FrameStats {
    fn collect(waveform: &[f32], sample_rate: u32) -> Result<Self> {
        let mut fft = FftResources::new(FRAME_SIZE);
        let window: Vec<f32> = (0..FRAME_SIZE).map(|i| hann_value(i, FRAME_SIZE)).collect();
        let bins = FRAME_SIZE / 2 + 1;
        let bin_hz = sample_rate as f32 / FRAME_SIZE as f32;
        let freqs: Vec<f32> = (0..bins).map(|i| i as f32 * bin_hz).collect();
        let mel_bank = mel_filterbank(sample_rate, bins);
        let chroma_map = chroma_classes(&freqs);
        let contrast_edges = contrast_band_edges(sample_rate, bins, bin_hz);

        // Centre frames on hop boundaries by padding half a frame each side.
        let pad = FRAME_SIZE / 2;
        let mut padded = vec![0.0; waveform.len() + 2 * pad];
        padded[pad..pad + waveform.len()].copy_from_slice(waveform);
        let frame_count = 1 + waveform.len() / HOP_SIZE;

        let mut stats = Self {
            centroid: Vec::with_capacity(frame_count),
            bandwidth: Vec::with_capacity(frame_count),
            rolloff: Vec::with_capacity(frame_count),
            zcr: Vec::with_capacity(frame_count),
            rms: Vec::with_capacity(frame_count),
            contrast: Vec::with_capacity(frame_count),
            chroma: Vec::with_capacity(frame_count),
            onset: Vec::with_capacity(frame_count),
            mfcc: vec![Vec::with_capacity(frame_count); N_MFCC],
        };

        let mut magnitude = vec![0.0; bins];
        let mut log_mel = vec![0.0; N_MELS];
        let mut previous_log_mel: Option<Vec<f32>> = None;

        for frame_index in 0..frame_count {
            let start = frame_index * HOP_SIZE;
            let frame = &padded[start..start + FRAME_SIZE];

            stats.rms.push(compute_rms(frame));
            stats.zcr.push(zero_crossing_rate(frame));

            for (slot, (sample, w)) in fft.input.iter_mut().zip(frame.iter().zip(&window)) {
                *slot = sample * w;
            }
            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;
            for (mag, bin) in magnitude.iter_mut().zip(&fft.spectrum) {
                *mag = bin.norm();
            }

            let total: f32 = magnitude.iter().sum();
            let centroid = if total > f32::EPSILON {
                magnitude.iter().zip(&freqs).map(|(m, f)| m * f).sum::<f32>() / total
            } else {
                0.0
            };
            let bandwidth = if total > f32::EPSILON {
                let spread: f32 = magnitude
                    .iter()
                    .zip(&freqs)
                    .map(|(m, f)| m * (f - centroid).powi(2))
                    .sum();
                (spread / total).sqrt()
            } else {
                0.0
            };
            stats.centroid.push(centroid);
            stats.bandwidth.push(bandwidth);
            stats.rolloff.push(spectral_rolloff(&magnitude, &freqs, total));
            stats.contrast.push(spectral_contrast(&magnitude, &contrast_edges));
            stats.chroma.push(chroma_frame_mean(&magnitude, &chroma_map));

            for (m, filter) in mel_bank.iter().enumerate() {
                let energy: f32 = filter
                    .iter()
                    .map(|&(bin, weight)| weight * magnitude[bin] * magnitude[bin])
                    .sum();
                log_mel[m] = power_to_db(energy);
            }
            for (k, row) in stats.mfcc.iter_mut().enumerate() {
                row.push(dct_coefficient(&log_mel, k));
            }

            let flux = match &previous_log_mel {
                Some(prev) => log_mel
                    .iter()
                    .zip(prev)
                    .map(|(cur, old)| (cur - old).max(0.0))
                    .sum::<f32>()
                    / N_MELS as f32,
                None => 0.0,
            };
            stats.onset.push(flux);
            previous_log_mel = Some(log_mel.clone());
        }

        Ok(stats)
    }

    fn summarize(&self, sample_rate: u32) -> FeatureVector {
        let mut features = FeatureVector::new();
        let (centroid_mean, centroid_std) = mean_std(&self.centroid);
        features.push("spectral_centroid_mean", centroid_mean);
        features.push("spectral_centroid_std", centroid_std);
        features.push("rolloff_mean", mean_std(&self.rolloff).0);
        features.push("zero_crossing_rate", mean_std(&self.zcr).0);
        features.push("tempo", estimate_tempo(&self.onset, sample_rate));
        let (rms_mean, rms_std) = mean_std(&self.rms);
        features.push("rms_mean", rms_mean);
        features.push("rms_std", rms_std);
        features.push("contrast_mean", mean_std(&self.contrast).0);
        features.push("bandwidth_mean", mean_std(&self.bandwidth).0);
        for (index, row) in self.mfcc.iter().enumerate() {
            let (mean, std) = mean_std(row);
            features.push(format!("mfcc_{}_mean", index + 1), mean);
            features.push(format!("mfcc_{}_std", index + 1), std);
        }
        features.push("chroma_mean", mean_std(&self.chroma).0);
        features
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Self {
            plan,
            scratch,
            spectrum,
            input,
        }
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.input.len())
            .finish()
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    let crossings = frame
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / frame.len() as f32
}

/// Symmetric Hann window value.
pub(crate) fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.max(0.0).sqrt())
}

fn power_to_db(power: f32) -> f32 {
    10.0 * power.max(POWER_FLOOR).log10()
}

fn spectral_rolloff(magnitude: &[f32], freqs: &[f32], total: f32) -> f32 {
    if total <= f32::EPSILON {
        return 0.0;
    }
    let target = total * ROLLOFF_PERCENT;
    let mut cumulative = 0.0;
    for (mag, freq) in magnitude.iter().zip(freqs) {
        cumulative += mag;
        if cumulative >= target {
            return *freq;
        }
    }
    freqs.last().copied().unwrap_or(0.0)
}

/// Bin ranges of the octave bands used for spectral contrast.
fn contrast_band_edges(sample_rate: u32, bins: usize, bin_hz: f32) -> Vec<(usize, usize)> {
    let nyquist = sample_rate as f32 * 0.5;
    let mut edges_hz = vec![0.0];
    for band in 0..CONTRAST_BANDS {
        edges_hz.push((CONTRAST_FMIN * 2f32.powi(band as i32)).min(nyquist));
    }
    edges_hz.push(nyquist);

    edges_hz
        .windows(2)
        .map(|pair| {
            let lo = ((pair[0] / bin_hz).floor() as usize).min(bins - 1);
            let hi = ((pair[1] / bin_hz).ceil() as usize).clamp(lo + 1, bins);
            (lo, hi)
        })
        .collect()
}

fn spectral_contrast(magnitude: &[f32], edges: &[(usize, usize)]) -> f32 {
    let mut sum = 0.0;
    let mut sorted = Vec::new();
    for &(lo, hi) in edges {
        sorted.clear();
        sorted.extend(magnitude[lo..hi].iter().map(|m| m * m));
        sorted.sort_by(|a, b| a.total_cmp(b));
        let take = ((sorted.len() as f32 * CONTRAST_QUANTILE).round() as usize).max(1);
        let valley = sorted[..take].iter().sum::<f32>() / take as f32;
        let peak = sorted[sorted.len() - take..].iter().sum::<f32>() / take as f32;
        sum += power_to_db(peak) - power_to_db(valley);
    }
    sum / edges.len().max(1) as f32
}

/// Pitch class (C = 0) of each bin, `None` for DC.
fn chroma_classes(freqs: &[f32]) -> Vec<Option<usize>> {
    freqs
        .iter()
        .map(|&f| {
            if f <= 0.0 {
                return None;
            }
            let semitones_from_a = (12.0 * (f / 440.0).log2()).round() as i64;
            Some((semitones_from_a + 9).rem_euclid(12) as usize)
        })
        .collect()
}

/// Mean of the max-normalised chroma vector of one frame.
fn chroma_frame_mean(magnitude: &[f32], classes: &[Option<usize>]) -> f32 {
    let mut chroma = [0.0_f32; 12];
    for (mag, class) in magnitude.iter().zip(classes) {
        if let Some(c) = class {
            chroma[*c] += mag * mag;
        }
    }
    let max = chroma.iter().copied().fold(0.0_f32, f32::max);
    if max <= POWER_FLOOR {
        return 0.0;
    }
    chroma.iter().map(|c| c / max).sum::<f32>() / 12.0
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Sparse HTK mel filterbank: for each band, the `(bin, weight)` pairs with
/// non-zero weight.
fn mel_filterbank(sample_rate: u32, bins: usize) -> Vec<Vec<(usize, f32)>> {
    let bin_hz = sample_rate as f32 / FRAME_SIZE as f32;
    let mel_max = hz_to_mel(sample_rate as f32 * 0.5);
    let points: Vec<f32> = (0..N_MELS + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (N_MELS + 1) as f32))
        .collect();

    (0..N_MELS)
        .map(|m| {
            let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
            (0..bins)
                .filter_map(|k| {
                    let freq = k as f32 * bin_hz;
                    let weight = if freq >= left && freq <= center && center > left {
                        (freq - left) / (center - left)
                    } else if freq > center && freq <= right && right > center {
                        (right - freq) / (right - center)
                    } else {
                        0.0
                    };
                    (weight > 0.0).then_some((k, weight))
                })
                .collect()
        })
        .collect()
}

/// Orthonormal DCT-II coefficient `k` of `input`.
fn dct_coefficient(input: &[f32], k: usize) -> f32 {
    let n = input.len() as f32;
    let sum: f32 = input
        .iter()
        .enumerate()
        .map(|(i, x)| x * (PI * k as f32 * (2.0 * i as f32 + 1.0) / (2.0 * n)).cos())
        .sum();
    let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
    sum * scale
}

/// Autocorrelation tempo estimate over the onset envelope, weighted by a
/// log-normal prior centred on 120 BPM.
fn estimate_tempo(onset: &[f32], sample_rate: u32) -> f32 {
    let frames_per_second = sample_rate as f32 / HOP_SIZE as f32;
    let min_lag = ((60.0 * frames_per_second / MAX_BPM).floor() as usize).max(1);
    let max_lag = (60.0 * frames_per_second / MIN_BPM).ceil() as usize;
    if onset.len() <= min_lag + 1 {
        return FALLBACK_BPM;
    }

    let (mean, std) = mean_std(onset);
    if std <= 1e-6 {
        return FALLBACK_BPM;
    }
    let centred: Vec<f32> = onset.iter().map(|v| v - mean).collect();

    let mut best: Option<(usize, f32)> = None;
    for lag in min_lag..=max_lag.min(centred.len() - 1) {
        let corr: f32 = centred
            .iter()
            .zip(&centred[lag..])
            .map(|(a, b)| a * b)
            .sum::<f32>()
            / (centred.len() - lag) as f32;
        let bpm = 60.0 * frames_per_second / lag as f32;
        let octaves = (bpm / PRIOR_BPM).log2();
        let weighted = corr * (-0.5 * octaves * octaves).exp();
        if best.map_or(true, |(_, score)| weighted > score) {
            best = Some((lag, weighted));
        }
    }

    match best {
        Some((lag, score)) if score > 0.0 => 60.0 * frames_per_second / lag as f32,
        _ => FALLBACK_BPM,
    }
}
