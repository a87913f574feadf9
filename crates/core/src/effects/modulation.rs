use std::f32::consts::TAU;

use super::{
    filter::{allpass_coefficient, AllPass},
    max_filter_hz, Effect,
};

const CHORUS_CENTRE_MS: f32 = 7.0;
const CHORUS_SWING_MS: f32 = 5.0;
const PHASER_STAGES: usize = 6;
const PHASER_CENTRE_HZ: f32 = 1_300.0;
const PHASER_SPAN_OCTAVES: f32 = 2.0;
const PHASER_MIN_HZ: f32 = 20.0;

/// Sine LFO with a running phase.
#[derive(Debug, Clone)]
struct Lfo {
    phase: f32,
    increment: f32,
}

impl Lfo {
    fn new(sample_rate: f32, rate_hz: f32) -> Self {
        Self {
            phase: 0.0,
            increment: TAU * rate_hz / sample_rate,
        }
    }

    fn advance(&mut self) -> f32 {
        let value = self.phase.sin();
        self.phase = (self.phase + self.increment) % TAU;
        value
    }
}

/// Single-voice chorus: a short delay line whose read position is swept by
/// the LFO, blended with the dry signal.
#[derive(Debug, Clone)]
pub struct Chorus {
    lfo: Lfo,
    depth: f32,
    mix: f32,
    centre: f32,
    swing: f32,
    line: Vec<f32>,
    write: usize,
}

impl Chorus {
    pub fn new(sample_rate: f32, rate_hz: f32, depth: f32, mix: f32) -> Self {
        let centre = CHORUS_CENTRE_MS * 0.001 * sample_rate;
        let swing = CHORUS_SWING_MS * 0.001 * sample_rate;
        let capacity = (centre + swing).ceil() as usize + 2;
        Self {
            lfo: Lfo::new(sample_rate, rate_hz),
            depth: depth.clamp(0.0, 1.0),
            mix: mix.clamp(0.0, 1.0),
            centre,
            swing,
            line: vec![0.0; capacity],
            write: 0,
        }
    }

    fn read_fractional(&self, delay: f32) -> f32 {
        let len = self.line.len();
        let whole = delay.floor() as usize;
        let frac = delay - whole as f32;
        let a = self.line[(self.write + len - whole) % len];
        let b = self.line[(self.write + len - whole - 1) % len];
        a + (b - a) * frac
    }
}

impl Effect for Chorus {
    fn name(&self) -> &'static str {
        "chorus"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        if self.mix <= 0.0 {
            return;
        }
        for sample in buffer.iter_mut() {
            self.line[self.write] = *sample;
            let delay = (self.centre + self.depth * self.swing * self.lfo.advance()).max(1.0);
            let wet = self.read_fractional(delay);
            *sample = *sample * (1.0 - self.mix) + wet * self.mix;
            self.write = (self.write + 1) % self.line.len();
        }
    }
}

/// Six-stage all-pass phaser with feedback around the cascade.
#[derive(Debug, Clone)]
pub struct Phaser {
    sample_rate: f32,
    lfo: Lfo,
    depth: f32,
    feedback: f32,
    mix: f32,
    stages: [AllPass; PHASER_STAGES],
    last: f32,
}

impl Phaser {
    pub fn new(sample_rate: f32, rate_hz: f32, depth: f32, feedback: f32, mix: f32) -> Self {
        Self {
            sample_rate,
            lfo: Lfo::new(sample_rate, rate_hz),
            depth: depth.clamp(0.0, 1.0),
            feedback: feedback.clamp(-0.95, 0.95),
            mix: mix.clamp(0.0, 1.0),
            stages: Default::default(),
            last: 0.0,
        }
    }
}

impl Effect for Phaser {
    fn name(&self) -> &'static str {
        "phaser"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        if self.mix <= 0.0 {
            return;
        }
        let max_hz = max_filter_hz(self.sample_rate);
        let min_hz = PHASER_MIN_HZ.min(max_hz);
        for sample in buffer.iter_mut() {
            let sweep = self.depth * PHASER_SPAN_OCTAVES * self.lfo.advance();
            let freq = (PHASER_CENTRE_HZ * sweep.exp2()).clamp(min_hz, max_hz);
            let coeff = allpass_coefficient(self.sample_rate, freq);

            let mut wet = *sample + self.feedback * self.last;
            for stage in self.stages.iter_mut() {
                wet = stage.tick(wet, coeff);
            }
            self.last = wet;
            *sample = *sample * (1.0 - self.mix) + wet * self.mix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(len: usize) -> Vec<f32> {
        let mut buffer = vec![0.0; len];
        buffer[0] = 1.0;
        buffer
    }

    #[test]
    fn zero_mix_is_bypass() {
        let input: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut chorus_out = input.clone();
        Chorus::new(22_050.0, 1.0, 0.5, 0.0).process(&mut chorus_out);
        assert_eq!(chorus_out, input);

        let mut phaser_out = input.clone();
        Phaser::new(22_050.0, 1.0, 0.5, 0.1, 0.0).process(&mut phaser_out);
        assert_eq!(phaser_out, input);
    }

    #[test]
    fn chorus_echoes_after_centre_delay() {
        let mut buffer = impulse(400);
        Chorus::new(22_050.0, 0.7, 0.0, 0.5).process(&mut buffer);
        let centre = (CHORUS_CENTRE_MS * 0.001 * 22_050.0).round() as usize;
        assert!((buffer[0] - 0.5).abs() < 1e-6);
        let echo_energy: f32 = buffer[centre - 1..=centre + 1].iter().map(|s| s.abs()).sum();
        assert!((echo_energy - 0.5).abs() < 1e-3, "{echo_energy}");
    }

    #[test]
    fn phaser_handles_rates_below_its_floor() {
        let mut buffer: Vec<f32> = (0..200).map(|i| (i as f32 * 0.3).sin()).collect();
        Phaser::new(30.0, 0.7, 0.6, 0.2, 0.2).process(&mut buffer);
        assert!(buffer.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn phaser_stays_bounded() {
        let mut buffer: Vec<f32> = (0..20_000).map(|i| (i as f32 * 0.05).sin()).collect();
        Phaser::new(22_050.0, 0.7, 0.6, 0.2, 0.2).process(&mut buffer);
        assert!(buffer.iter().all(|s| s.is_finite() && s.abs() < 2.0));
    }
}
