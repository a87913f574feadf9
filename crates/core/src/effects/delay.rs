use super::Effect;

/// Feedback echo blended with the dry signal.
#[derive(Debug, Clone)]
pub struct Delay {
    line: Vec<f32>,
    index: usize,
    feedback: f32,
    mix: f32,
}

impl Delay {
    pub fn new(sample_rate: f32, delay_seconds: f32, feedback: f32, mix: f32) -> Self {
        let len = (delay_seconds.max(0.0) * sample_rate).round().max(1.0) as usize;
        Self {
            line: vec![0.0; len],
            index: 0,
            feedback: feedback.clamp(0.0, 0.95),
            mix: mix.clamp(0.0, 1.0),
        }
    }

    pub fn delay_samples(&self) -> usize {
        self.line.len()
    }
}

impl Effect for Delay {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let delayed = self.line[self.index];
            self.line[self.index] = *sample + delayed * self.feedback;
            self.index = (self.index + 1) % self.line.len();
            *sample = *sample * (1.0 - self.mix) + delayed * self.mix;
        }
    }
}
