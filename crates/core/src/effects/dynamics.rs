use super::{db_to_linear, linear_to_db, time_coefficient, Effect};

/// Feed-forward peak compressor with attack/release ballistics.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: f32, threshold_db: f32, ratio: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            threshold_db,
            ratio: ratio.max(1.0),
            attack_coeff: time_coefficient(sample_rate, attack_ms),
            release_coeff: time_coefficient(sample_rate, release_ms),
            envelope: 0.0,
        }
    }

    fn gain_for(&self, level: f32) -> f32 {
        let level_db = linear_to_db(level);
        if level_db <= self.threshold_db {
            return 1.0;
        }
        let over = level_db - self.threshold_db;
        db_to_linear(-over * (1.0 - 1.0 / self.ratio))
    }
}

impl Effect for Compressor {
    fn name(&self) -> &'static str {
        "compressor"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let input = sample.abs();
            let coeff = if input > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = coeff * self.envelope + (1.0 - coeff) * input;
            *sample *= self.gain_for(self.envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_signal_passes_untouched() {
        let mut comp = Compressor::new(22_050.0, -15.0, 4.0, 10.0, 100.0);
        let mut buffer = vec![0.01; 1_000];
        comp.process(&mut buffer);
        assert!(buffer.iter().all(|s| (*s - 0.01).abs() < 1e-7));
    }

    #[test]
    fn loud_signal_is_reduced() {
        let mut comp = Compressor::new(22_050.0, -20.0, 4.0, 1.0, 50.0);
        let mut buffer = vec![1.0; 4_000];
        comp.process(&mut buffer);
        // 20 dB over threshold at 4:1 settles at -15 dB.
        let settled = *buffer.last().unwrap();
        assert!((linear_to_db(settled) + 15.0).abs() < 0.5, "{settled}");
    }
}
