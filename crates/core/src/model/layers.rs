use rand::Rng;

use super::{checkpoint::TensorStore, FeatureMap, Module};
use crate::{LofiError, Result};

const BATCH_NORM_EPS: f32 = 1e-5;

// ---------------------------------------------------------------------------
// Strided 1-D convolution
// ---------------------------------------------------------------------------

/// 1-D convolution with "same"-style padding of `kernel_size / 2`.
#[derive(Debug, Clone)]
pub struct Conv1d {
    weight: Vec<f32>, // [out_ch, in_ch, kernel_size] row-major
    bias: Vec<f32>,   // [out_ch]
    in_ch: usize,
    out_ch: usize,
    kernel_size: usize,
    stride: usize,
}

impl Conv1d {
    pub fn init<R: Rng>(
        rng: &mut R,
        in_ch: usize,
        out_ch: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        let bound = 1.0 / ((in_ch * kernel_size) as f32).sqrt();
        Self {
            weight: uniform(rng, out_ch * in_ch * kernel_size, bound),
            bias: uniform(rng, out_ch, bound),
            in_ch,
            out_ch,
            kernel_size,
            stride,
        }
    }

    pub fn load(
        store: &mut TensorStore,
        prefix: &str,
        in_ch: usize,
        out_ch: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Result<Self> {
        Ok(Self {
            weight: store.take(&format!("{prefix}.weight"), &[out_ch, in_ch, kernel_size])?,
            bias: store.take(&format!("{prefix}.bias"), &[out_ch])?,
            in_ch,
            out_ch,
            kernel_size,
            stride,
        })
    }

    pub fn export(&self, store: &mut TensorStore, prefix: &str) {
        store.insert(
            format!("{prefix}.weight"),
            vec![self.out_ch, self.in_ch, self.kernel_size],
            self.weight.clone(),
        );
        store.insert(format!("{prefix}.bias"), vec![self.out_ch], self.bias.clone());
    }

    pub fn output_frames(&self, frames: usize) -> usize {
        let padded = frames + 2 * (self.kernel_size / 2);
        if padded < self.kernel_size {
            return 0;
        }
        (padded - self.kernel_size) / self.stride + 1
    }
}

impl Module for Conv1d {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        if input.channels() != self.in_ch {
            return Err(LofiError::input(
                "conv1d",
                format!(
                    "expected {} input channels, got {}x{}",
                    self.in_ch,
                    input.channels(),
                    input.frames()
                ),
            ));
        }
        let len = input.frames();
        let out_len = self.output_frames(len);
        if out_len == 0 {
            return Err(LofiError::input(
                "conv1d",
                format!("input of {len} frames is shorter than kernel {}", self.kernel_size),
            ));
        }
        let pad = (self.kernel_size / 2) as isize;
        let mut output = FeatureMap::zeros(self.out_ch, out_len);

        for o in 0..self.out_ch {
            let out_row = output.channel_mut(o);
            out_row.fill(self.bias[o]);
            for i in 0..self.in_ch {
                let x = input.channel(i);
                let w_base = (o * self.in_ch + i) * self.kernel_size;
                for k in 0..self.kernel_size {
                    let w = self.weight[w_base + k];
                    let offset = k as isize - pad;
                    for (t, out) in out_row.iter_mut().enumerate() {
                        let idx = (t * self.stride) as isize + offset;
                        if idx >= 0 && (idx as usize) < len {
                            *out += w * x[idx as usize];
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

// ---------------------------------------------------------------------------
// Batch normalisation (inference statistics only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
}

impl BatchNorm1d {
    pub fn identity(channels: usize) -> Self {
        Self {
            gamma: vec![1.0; channels],
            beta: vec![0.0; channels],
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
        }
    }

    pub fn load(store: &mut TensorStore, prefix: &str, channels: usize) -> Result<Self> {
        let shape = [channels];
        Ok(Self {
            gamma: store.take(&format!("{prefix}.weight"), &shape)?,
            beta: store.take(&format!("{prefix}.bias"), &shape)?,
            running_mean: store.take(&format!("{prefix}.running_mean"), &shape)?,
            running_var: store.take(&format!("{prefix}.running_var"), &shape)?,
        })
    }

    pub fn export(&self, store: &mut TensorStore, prefix: &str) {
        let shape = vec![self.gamma.len()];
        store.insert(format!("{prefix}.weight"), shape.clone(), self.gamma.clone());
        store.insert(format!("{prefix}.bias"), shape.clone(), self.beta.clone());
        store.insert(
            format!("{prefix}.running_mean"),
            shape.clone(),
            self.running_mean.clone(),
        );
        store.insert(format!("{prefix}.running_var"), shape, self.running_var.clone());
    }

    fn apply(&self, map: &mut FeatureMap) {
        for c in 0..map.channels() {
            let scale = self.gamma[c] / (self.running_var[c] + BATCH_NORM_EPS).sqrt();
            let shift = self.beta[c] - self.running_mean[c] * scale;
            map.channel_mut(c).iter_mut().for_each(|v| *v = *v * scale + shift);
        }
    }
}

// ---------------------------------------------------------------------------
// Fully connected layer, applied independently to every frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Vec<f32>, // [out, in]
    bias: Vec<f32>,   // [out]
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn init<R: Rng>(rng: &mut R, in_dim: usize, out_dim: usize) -> Self {
        let bound = 1.0 / (in_dim as f32).sqrt();
        Self {
            weight: uniform(rng, out_dim * in_dim, bound),
            bias: uniform(rng, out_dim, bound),
            in_dim,
            out_dim,
        }
    }

    pub fn load(store: &mut TensorStore, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Self> {
        Ok(Self {
            weight: store.take(&format!("{prefix}.weight"), &[out_dim, in_dim])?,
            bias: store.take(&format!("{prefix}.bias"), &[out_dim])?,
            in_dim,
            out_dim,
        })
    }

    pub fn export(&self, store: &mut TensorStore, prefix: &str) {
        store.insert(
            format!("{prefix}.weight"),
            vec![self.out_dim, self.in_dim],
            self.weight.clone(),
        );
        store.insert(format!("{prefix}.bias"), vec![self.out_dim], self.bias.clone());
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Applies the layer to a single vector.
    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        debug_assert_eq!(input.len(), self.in_dim);
        (0..self.out_dim)
            .map(|o| {
                let row = &self.weight[o * self.in_dim..(o + 1) * self.in_dim];
                self.bias[o] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>()
            })
            .collect()
    }
}

impl Module for Linear {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        if input.channels() != self.in_dim {
            return Err(LofiError::input(
                "linear",
                format!("expected {} inputs, got {}", self.in_dim, input.channels()),
            ));
        }
        let mut output = FeatureMap::zeros(self.out_dim, input.frames());
        let mut column = vec![0.0; self.in_dim];
        for t in 0..input.frames() {
            for (c, slot) in column.iter_mut().enumerate() {
                *slot = input.channel(c)[t];
            }
            for (o, value) in self.apply(&column).into_iter().enumerate() {
                output.channel_mut(o)[t] = value;
            }
        }
        Ok(output)
    }

    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

// ---------------------------------------------------------------------------
// Conv block: conv → (batch norm) → GELU → dropout → (residual)
// ---------------------------------------------------------------------------

/// Convolution block shared by the encoder and decoder.
///
/// Dropout is recorded for the architecture but is an identity at inference.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv1d,
    norm: Option<BatchNorm1d>,
    dropout: f32,
    residual: bool,
}

impl ConvBlock {
    pub fn init<R: Rng>(
        rng: &mut R,
        in_ch: usize,
        out_ch: usize,
        kernel_size: usize,
        stride: usize,
        batch_norm: bool,
        dropout: f32,
    ) -> Self {
        Self {
            conv: Conv1d::init(rng, in_ch, out_ch, kernel_size, stride),
            norm: batch_norm.then(|| BatchNorm1d::identity(out_ch)),
            dropout,
            residual: in_ch == out_ch && stride == 1,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load(
        store: &mut TensorStore,
        prefix: &str,
        in_ch: usize,
        out_ch: usize,
        kernel_size: usize,
        stride: usize,
        batch_norm: bool,
        dropout: f32,
    ) -> Result<Self> {
        let conv = Conv1d::load(store, &format!("{prefix}.conv"), in_ch, out_ch, kernel_size, stride)?;
        let norm = if batch_norm {
            Some(BatchNorm1d::load(store, &format!("{prefix}.bn"), out_ch)?)
        } else {
            None
        };
        Ok(Self {
            conv,
            norm,
            dropout,
            residual: in_ch == out_ch && stride == 1,
        })
    }

    pub fn export(&self, store: &mut TensorStore, prefix: &str) {
        self.conv.export(store, &format!("{prefix}.conv"));
        if let Some(norm) = &self.norm {
            norm.export(store, &format!("{prefix}.bn"));
        }
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_ch
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn has_residual(&self) -> bool {
        self.residual
    }
}

impl Module for ConvBlock {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let mut out = self.conv.forward(input)?;
        if let Some(norm) = &self.norm {
            norm.apply(&mut out);
        }
        out.map_in_place(gelu);
        if self.residual {
            out.add_assign(input)?;
        }
        Ok(out)
    }

    fn parameter_count(&self) -> usize {
        self.conv.parameter_count()
            + self
                .norm
                .as_ref()
                .map_or(0, |norm| norm.gamma.len() + norm.beta.len())
    }
}

// ---------------------------------------------------------------------------
// Activations and resampling
// ---------------------------------------------------------------------------

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Exact (erf based) GELU.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Abramowitz–Stegun 7.1.26 rational approximation, |error| < 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

/// Nearest-neighbour upsampling by a factor of two along time.
pub fn upsample2(input: &FeatureMap) -> FeatureMap {
    let mut output = FeatureMap::zeros(input.channels(), input.frames() * 2);
    for c in 0..input.channels() {
        let src = input.channel(c);
        for (pair, &value) in output.channel_mut(c).chunks_exact_mut(2).zip(src) {
            pair[0] = value;
            pair[1] = value;
        }
    }
    output
}

fn uniform<R: Rng>(rng: &mut R, len: usize, bound: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-bound..bound)).collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn conv_with(weight: Vec<f32>, bias: Vec<f32>, in_ch: usize, out_ch: usize, k: usize, stride: usize) -> Conv1d {
        Conv1d {
            weight,
            bias,
            in_ch,
            out_ch,
            kernel_size: k,
            stride,
        }
    }

    #[test]
    fn conv_matches_hand_computation() {
        // Kernel [1, 2, 3] with zero padding of one sample on each side.
        let conv = conv_with(vec![1.0, 2.0, 3.0], vec![0.5], 1, 1, 3, 1);
        let input = FeatureMap::from_channels(vec![vec![1.0, 2.0, 3.0, 4.0]]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.channel(0), &[8.5, 14.5, 20.5, 11.5]);
    }

    #[test]
    fn strided_conv_halves_length() {
        let conv = conv_with(vec![0.0, 1.0, 0.0], vec![0.0], 1, 1, 3, 2);
        let input = FeatureMap::from_channels(vec![(0..7).map(|v| v as f32).collect()]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.channel(0), &[0.0, 2.0, 4.0, 6.0]);
        assert_eq!(conv.output_frames(8), 4);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let conv = Conv1d::init(&mut rng, 2, 4, 3, 1);
        let input = FeatureMap::zeros(3, 10);
        assert!(conv.forward(&input).is_err());
    }

    #[test]
    fn batch_norm_uses_running_statistics() {
        let norm = BatchNorm1d {
            gamma: vec![2.0],
            beta: vec![1.0],
            running_mean: vec![3.0],
            running_var: vec![4.0],
        };
        let mut map = FeatureMap::from_channels(vec![vec![3.0, 5.0]]).unwrap();
        norm.apply(&mut map);
        assert!((map.channel(0)[0] - 1.0).abs() < 1e-5);
        assert!((map.channel(0)[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn gelu_reference_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158_655_3).abs() < 1e-5);
        assert!((gelu(3.0) - 2.995_950_5).abs() < 1e-5);
    }

    #[test]
    fn residual_only_when_shapes_match() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert!(ConvBlock::init(&mut rng, 8, 8, 3, 1, true, 0.1).has_residual());
        assert!(!ConvBlock::init(&mut rng, 8, 8, 3, 2, true, 0.1).has_residual());
        assert!(!ConvBlock::init(&mut rng, 8, 16, 3, 1, true, 0.1).has_residual());
    }

    #[test]
    fn upsample_repeats_frames() {
        let input = FeatureMap::from_channels(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let out = upsample2(&input);
        assert_eq!(out.channel(0), &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(out.channel(1), &[3.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn linear_applies_per_frame() {
        let linear = Linear {
            weight: vec![1.0, 1.0, 2.0, -1.0],
            bias: vec![0.0, 1.0],
            in_dim: 2,
            out_dim: 2,
        };
        assert_eq!(linear.apply(&[3.0, 4.0]), vec![7.0, 3.0]);
        let map = FeatureMap::from_channels(vec![vec![3.0, 1.0], vec![4.0, 1.0]]).unwrap();
        let out = linear.forward(&map).unwrap();
        assert_eq!(out.channel(0), &[7.0, 2.0]);
        assert_eq!(out.channel(1), &[3.0, 2.0]);
    }
}
