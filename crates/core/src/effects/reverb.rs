use super::Effect;

const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];
const TUNING_RATE: f32 = 44_100.0;
const INPUT_GAIN: f32 = 0.015;
const ROOM_SCALE: f32 = 0.28;
const ROOM_OFFSET: f32 = 0.7;
const DAMPING: f32 = 0.5;
const DAMP_SCALE: f32 = 0.4;
const WET_SCALE: f32 = 3.0;
const DRY_SCALE: f32 = 2.0;
const DRY_LEVEL: f32 = 0.4;
const ALLPASS_FEEDBACK: f32 = 0.5;

#[derive(Debug, Clone)]
struct Comb {
    buffer: Vec<f32>,
    index: usize,
    store: f32,
}

impl Comb {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
            store: 0.0,
        }
    }

    fn tick(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.index];
        self.store = output * (1.0 - damp) + self.store * damp;
        self.buffer[self.index] = input + self.store * feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }
}

#[derive(Debug, Clone)]
struct Diffuser {
    buffer: Vec<f32>,
    index: usize,
}

impl Diffuser {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
        }
    }

    fn tick(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.index];
        self.buffer[self.index] = input + delayed * ALLPASS_FEEDBACK;
        self.index = (self.index + 1) % self.buffer.len();
        delayed - input
    }
}

/// Schroeder/Moorer style reverb: eight damped feedback combs in parallel
/// followed by four series all-pass diffusers.
#[derive(Debug, Clone)]
pub struct Reverb {
    combs: Vec<Comb>,
    diffusers: Vec<Diffuser>,
    feedback: f32,
    damp: f32,
    wet: f32,
    dry: f32,
}

impl Reverb {
    pub fn new(sample_rate: f32, room_size: f32, wet_level: f32) -> Self {
        let scale = sample_rate / TUNING_RATE;
        let scaled = |len: usize| ((len as f32) * scale).round() as usize;
        Self {
            combs: COMB_TUNING.iter().map(|&len| Comb::new(scaled(len))).collect(),
            diffusers: ALLPASS_TUNING
                .iter()
                .map(|&len| Diffuser::new(scaled(len)))
                .collect(),
            feedback: room_size.clamp(0.0, 1.0) * ROOM_SCALE + ROOM_OFFSET,
            damp: DAMPING * DAMP_SCALE,
            wet: wet_level.clamp(0.0, 1.0) * WET_SCALE,
            dry: DRY_LEVEL * DRY_SCALE,
        }
    }
}

impl Effect for Reverb {
    fn name(&self) -> &'static str {
        "reverb"
    }

    fn process(&mut self, buffer: &mut [f32]) {
        let (feedback, damp) = (self.feedback, self.damp);
        for sample in buffer.iter_mut() {
            let input = *sample * INPUT_GAIN;
            let mut out: f32 = self
                .combs
                .iter_mut()
                .map(|comb| comb.tick(input, feedback, damp))
                .sum();
            for diffuser in self.diffusers.iter_mut() {
                out = diffuser.tick(out);
            }
            *sample = out * self.wet + *sample * self.dry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_only_when_wet_is_zero() {
        let mut buffer = vec![0.5, -0.25, 0.0];
        Reverb::new(22_050.0, 0.9, 0.0).process(&mut buffer);
        assert_eq!(buffer, vec![0.4, -0.2, 0.0]);
    }

    #[test]
    fn tail_follows_an_impulse() {
        let mut buffer = vec![0.0; 22_050];
        buffer[0] = 1.0;
        Reverb::new(22_050.0, 0.7, 0.5).process(&mut buffer);
        let tail: f32 = buffer[1_000..].iter().map(|s| s.abs()).sum();
        assert!(tail > 0.0);
        assert!(buffer.iter().all(|s| s.is_finite()));
    }
}
