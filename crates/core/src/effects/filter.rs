use std::f32::consts::PI;

use super::Effect;

/// Second-order (RBJ) low-pass with Butterworth Q.
#[derive(Debug, Clone)]
pub struct LowPass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl LowPass {
    pub fn new(sample_rate: f32, cutoff_hz: f32) -> Self {
        let q = std::f32::consts::FRAC_1_SQRT_2;
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 - cos) * 0.5 / a0,
            b1: (1.0 - cos) / a0,
            b2: (1.0 - cos) * 0.5 / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub(crate) fn tick(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

impl Effect for LowPass {
    fn name(&self) -> &'static str {
        "lowpass"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.tick(*sample);
        }
    }
}

/// First-order all-pass section; the phaser retunes it every sample.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllPass {
    x1: f32,
    y1: f32,
}

impl AllPass {
    pub(crate) fn tick(&mut self, x: f32, coeff: f32) -> f32 {
        let y = coeff * x + self.x1 - coeff * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// All-pass coefficient placing the 90° phase point at `freq_hz`.
pub(crate) fn allpass_coefficient(sample_rate: f32, freq_hz: f32) -> f32 {
    let t = (PI * freq_hz / sample_rate).tan();
    (t - 1.0) / (t + 1.0)
}
