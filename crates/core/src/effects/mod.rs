//! Deterministic lofi effect chain.
//!
//! Stages run in a fixed order: compression, low-pass, chorus, reverb,
//! delay, phaser and a final trim. Each stage is rebuilt per call from the
//! normalised parameters and the mood baseline, so the chain holds no state
//! between calls.

mod delay;
mod dynamics;
mod filter;
mod modulation;
mod reverb;

pub use delay::Delay;
pub use dynamics::Compressor;
pub use filter::LowPass;
pub use modulation::{Chorus, Phaser};
pub use reverb::Reverb;

use crate::{audio, error::ensure_finite, EffectParameters, LofiError, Mood, Result};

const OUTPUT_TRIM_DB: f32 = -3.0;
const MIN_CUTOFF_HZ: f32 = 20.0;

/// One processing stage of the chain. Stages work in place and never change
/// the buffer length.
pub trait Effect: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, buffer: &mut [f32]);
}

/// Baseline intensities for a mood, before parameter scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoodSettings {
    pub reverb_wet: f32,
    pub reverb_room_size: f32,
    pub delay_mix: f32,
    pub chorus_depth: f32,
    pub lowpass_cutoff_hz: f32,
    pub phaser_depth: f32,
}

impl MoodSettings {
    pub fn for_mood(mood: Mood) -> Self {
        match mood {
            Mood::Relaxed => Self {
                reverb_wet: 0.25,
                reverb_room_size: 0.7,
                delay_mix: 0.15,
                chorus_depth: 0.3,
                lowpass_cutoff_hz: 8_000.0,
                phaser_depth: 0.4,
            },
            Mood::Focus => Self {
                reverb_wet: 0.15,
                reverb_room_size: 0.5,
                delay_mix: 0.1,
                chorus_depth: 0.2,
                lowpass_cutoff_hz: 10_000.0,
                phaser_depth: 0.3,
            },
            Mood::Sleep => Self {
                reverb_wet: 0.4,
                reverb_room_size: 0.9,
                delay_mix: 0.25,
                chorus_depth: 0.5,
                lowpass_cutoff_hz: 5_000.0,
                phaser_depth: 0.6,
            },
        }
    }
}

/// Fixed gain stage.
#[derive(Debug, Clone, Copy)]
pub struct Gain {
    linear: f32,
}

impl Gain {
    pub fn from_db(db: f32) -> Self {
        Self {
            linear: db_to_linear(db),
        }
    }
}

impl Effect for Gain {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        buffer.iter_mut().for_each(|s| *s *= self.linear);
    }
}

/// Parameter-driven DSP transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct EffectChain;

impl EffectChain {
    pub fn new() -> Self {
        Self
    }

    /// Builds the ordered stages for one call.
    pub fn stages(&self, sample_rate: u32, params: &EffectParameters) -> Vec<Box<dyn Effect>> {
        let chill = params.chill_level() / 100.0;
        let beat = params.beat_intensity() / 100.0;
        let vintage = params.vintage_effect() / 100.0;
        let mood = MoodSettings::for_mood(params.mood());
        let sr = sample_rate as f32;

        let cutoff = (mood.lowpass_cutoff_hz - vintage * 3_000.0).clamp(
            MIN_CUTOFF_HZ.min(max_filter_hz(sr)),
            max_filter_hz(sr),
        );

        vec![
            Box::new(Compressor::new(
                sr,
                -15.0 - vintage * 10.0,
                2.0 + vintage * 2.0,
                10.0 + vintage * 40.0,
                100.0 + vintage * 400.0,
            )),
            Box::new(LowPass::new(sr, cutoff)),
            Box::new(Chorus::new(
                sr,
                0.7 + chill * 0.5,
                mood.chorus_depth * chill,
                0.2 * chill,
            )),
            Box::new(Reverb::new(
                sr,
                mood.reverb_room_size,
                mood.reverb_wet * chill,
            )),
            Box::new(Delay::new(
                sr,
                0.125 + 0.125 * (1.0 - beat),
                0.4 * beat,
                mood.delay_mix * beat,
            )),
            Box::new(Phaser::new(
                sr,
                0.4 + 0.3 * chill,
                mood.phaser_depth * chill,
                0.2 * chill,
                0.2 * chill,
            )),
            Box::new(Gain::from_db(OUTPUT_TRIM_DB)),
        ]
    }

    /// Runs the full chain. The output has the input's length and a peak
    /// magnitude of at most 1.0.
    pub fn apply(
        &self,
        waveform: &[f32],
        sample_rate: u32,
        params: &EffectParameters,
    ) -> Result<Vec<f32>> {
        if waveform.is_empty() {
            return Err(LofiError::input("effect chain", "waveform is empty"));
        }
        if sample_rate == 0 {
            return Err(LofiError::input("effect chain", "sample rate must be positive"));
        }
        ensure_finite("effect chain input", waveform)?;

        let mut buffer = waveform.to_vec();
        for mut stage in self.stages(sample_rate, params) {
            stage.process(&mut buffer);
            tracing::trace!(stage = stage.name(), peak = audio::peak(&buffer), "effect stage");
        }

        ensure_finite("effect chain", &buffer)?;
        audio::peak_normalize(&mut buffer);
        tracing::debug!(samples = buffer.len(), mood = %params.mood(), "applied effect chain");
        Ok(buffer)
    }
}

/// Highest centre frequency a stage may tune to. At rates under about 44 Hz
/// this falls below the 20 Hz floor, and the floor gives way.
pub(crate) fn max_filter_hz(sample_rate: f32) -> f32 {
    sample_rate * 0.45
}

pub(crate) fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub(crate) fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-9).log10()
}

/// One-pole smoothing coefficient for a time constant in milliseconds.
pub(crate) fn time_coefficient(sample_rate: f32, ms: f32) -> f32 {
    if ms <= 0.0 {
        return 0.0;
    }
    (-1.0 / (sample_rate * ms * 0.001)).exp()
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn sine(len: usize, sample_rate: u32, freq: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn ten_second_sine_scenario() {
        let input = sine(220_500, 22_050, 440.0, 1.0);
        let params = EffectParameters::new(50.0, 50.0, 50.0, Mood::Relaxed);
        let output = EffectChain::new().apply(&input, 22_050, &params).unwrap();

        assert_eq!(output.len(), 220_500);
        assert!(audio::peak(&output) <= 1.0);
        assert_ne!(output, input);
    }

    #[test]
    fn length_and_peak_hold_for_extreme_parameters() {
        let input = sine(5_000, 22_050, 220.0, 1.0);
        let chain = EffectChain::new();
        for mood in Mood::ALL {
            for value in [0.0, 100.0] {
                let params = EffectParameters::new(value, value, value, mood);
                let output = chain.apply(&input, 22_050, &params).unwrap();
                assert_eq!(output.len(), input.len());
                assert!(audio::peak(&output) <= 1.0, "{mood} {value}");
            }
        }
    }

    #[test]
    fn loud_input_is_brought_under_unity() {
        let input = sine(4_000, 22_050, 110.0, 8.0);
        let params = EffectParameters::new(100.0, 100.0, 0.0, Mood::Sleep);
        let output = EffectChain::new().apply(&input, 22_050, &params).unwrap();
        assert!(audio::peak(&output) <= 1.0);
    }

    #[test]
    fn chain_is_deterministic() {
        let input = sine(8_000, 22_050, 330.0, 0.7);
        let params = EffectParameters::new(30.0, 80.0, 60.0, Mood::Focus);
        let chain = EffectChain::new();
        let a = chain.apply(&input, 22_050, &params).unwrap();
        let b = chain.apply(&input, 22_050, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stage_order_is_fixed() {
        let names: Vec<&str> = EffectChain::new()
            .stages(22_050, &EffectParameters::default())
            .iter()
            .map(|stage| stage.name())
            .collect();
        assert_eq!(
            names,
            ["compressor", "lowpass", "chorus", "reverb", "delay", "phaser", "gain"]
        );
    }

    #[test]
    fn very_low_sample_rates_are_processed() {
        let input = sine(400, 40, 3.0, 0.8);
        let chain = EffectChain::new();
        for sample_rate in [1, 10, 40, 44] {
            for mood in Mood::ALL {
                let params = EffectParameters::new(100.0, 100.0, 100.0, mood);
                let output = chain.apply(&input, sample_rate, &params).unwrap();
                assert_eq!(output.len(), input.len());
                assert!(output.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
            }
        }
    }

    #[test]
    fn rejects_empty_waveform() {
        let err = EffectChain::new()
            .apply(&[], 22_050, &EffectParameters::default())
            .unwrap_err();
        assert!(matches!(err, LofiError::Input { .. }));
    }

    #[test]
    fn gain_trim_attenuates() {
        let mut buffer = vec![1.0, -1.0];
        Gain::from_db(-6.0).process(&mut buffer);
        assert!((buffer[0] - 0.501).abs() < 1e-3);
    }
}
