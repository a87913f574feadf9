use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{LofiError, Result};

/// Reads a WAV file as mono `f32` samples at `target_rate`.
///
/// Supports 8, 16, 24 and 32-bit integer and 32-bit float files. Multi-channel
/// audio is averaged down to mono, then linearly resampled when the file rate
/// differs from `target_rate`.
pub fn read_wav(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(LofiError::input(
            "audio",
            format!("{} declares zero channels", path.display()),
        ));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let scale = match spec.bits_per_sample {
                8 => 1.0 / 128.0,
                16 => 1.0 / 32_768.0,
                24 => 1.0 / 8_388_608.0,
                32 => 1.0 / 2_147_483_648.0,
                bits => {
                    return Err(LofiError::input(
                        "audio",
                        format!("unsupported bit depth {bits} in {}", path.display()),
                    ))
                }
            };
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()?
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, hound::Error>>()?,
    };

    let mono = downmix(&interleaved, channels);
    if mono.is_empty() {
        return Err(LofiError::input(
            "audio",
            format!("{} contains no samples", path.display()),
        ));
    }

    tracing::debug!(
        path = %path.display(),
        channels,
        sample_rate = spec.sample_rate,
        frames = mono.len(),
        "decoded wav"
    );

    Ok(resample_linear(&mono, spec.sample_rate, target_rate))
}

/// Writes mono samples as a 32-bit float WAV file.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    let inv = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * inv)
        .collect()
}

/// Linear-interpolation resampler. Returns the input unchanged when the
/// rates match.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let next = samples[(idx + 1).min(last)];
            samples[idx] + (next - samples[idx]) * frac
        })
        .collect()
}

/// Returns the largest absolute sample value.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
}

/// Scales `samples` down so the peak magnitude does not exceed 1.0.
/// Quieter signals and silence are left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let peak = peak(samples);
    if peak > 1.0 {
        let gain = 1.0 / peak;
        samples.iter_mut().for_each(|s| *s *= gain);
    }
}
