use rand::Rng;

use super::{
    checkpoint::TensorStore,
    layers::{gelu, sigmoid, ConvBlock, Linear},
    FeatureMap, ModelArchitecture, Module,
};
use crate::{LofiError, Result};

const ENCODER_DROPOUT: f32 = 0.1;
const CONDITIONING_HIDDEN: usize = 128;

/// Projects a whole-clip feature vector to one gate in `[0, 1]` per latent
/// channel: linear, GELU, linear, sigmoid.
#[derive(Debug, Clone)]
struct FeatureGate {
    hidden: Linear,
    output: Linear,
}

impl FeatureGate {
    fn gates(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != self.hidden.in_dim() {
            return Err(LofiError::input(
                "encoder conditioning",
                format!(
                    "expected {} features, got {}",
                    self.hidden.in_dim(),
                    features.len()
                ),
            ));
        }
        let hidden: Vec<f32> = self.hidden.apply(features).into_iter().map(gelu).collect();
        Ok(self.output.apply(&hidden).into_iter().map(sigmoid).collect())
    }
}

/// Strided convolutional encoder.
///
/// Block `i` has `min(base * 2^i, max)` channels and stride 2, except the
/// last block which keeps stride 1.
#[derive(Debug, Clone)]
pub struct WaveformEncoder {
    blocks: Vec<ConvBlock>,
    conditioning: Option<FeatureGate>,
}

impl WaveformEncoder {
    pub(crate) fn init<R: Rng>(rng: &mut R, arch: &ModelArchitecture) -> Self {
        let mut in_ch = arch.input_channels;
        let mut blocks = Vec::with_capacity(arch.num_encoder_layers);
        for layer in 0..arch.num_encoder_layers {
            let out_ch = arch.encoder_channels(layer);
            let stride = block_stride(layer, arch.num_encoder_layers);
            blocks.push(ConvBlock::init(
                rng,
                in_ch,
                out_ch,
                arch.kernel_size,
                stride,
                true,
                ENCODER_DROPOUT,
            ));
            in_ch = out_ch;
        }
        let conditioning = arch.feature_dim.map(|dim| FeatureGate {
            hidden: Linear::init(rng, dim, CONDITIONING_HIDDEN),
            output: Linear::init(rng, CONDITIONING_HIDDEN, arch.latent_channels()),
        });
        Self {
            blocks,
            conditioning,
        }
    }

    pub(crate) fn load(store: &mut TensorStore, arch: &ModelArchitecture) -> Result<Self> {
        let mut in_ch = arch.input_channels;
        let mut blocks = Vec::with_capacity(arch.num_encoder_layers);
        for layer in 0..arch.num_encoder_layers {
            let out_ch = arch.encoder_channels(layer);
            blocks.push(ConvBlock::load(
                store,
                &format!("encoder.layers.{layer}"),
                in_ch,
                out_ch,
                arch.kernel_size,
                block_stride(layer, arch.num_encoder_layers),
                true,
                ENCODER_DROPOUT,
            )?);
            in_ch = out_ch;
        }
        let conditioning = match arch.feature_dim {
            Some(dim) => Some(FeatureGate {
                hidden: Linear::load(store, "encoder.feature_conditioning.0", dim, CONDITIONING_HIDDEN)?,
                output: Linear::load(
                    store,
                    "encoder.feature_conditioning.2",
                    CONDITIONING_HIDDEN,
                    arch.latent_channels(),
                )?,
            }),
            None => None,
        };
        Ok(Self {
            blocks,
            conditioning,
        })
    }

    pub(crate) fn export(&self, store: &mut TensorStore) {
        for (layer, block) in self.blocks.iter().enumerate() {
            block.export(store, &format!("encoder.layers.{layer}"));
        }
        if let Some(gate) = &self.conditioning {
            gate.hidden.export(store, "encoder.feature_conditioning.0");
            gate.output.export(store, "encoder.feature_conditioning.2");
        }
    }

    pub fn is_conditioned(&self) -> bool {
        self.conditioning.is_some()
    }

    pub fn blocks(&self) -> &[ConvBlock] {
        &self.blocks
    }

    /// Encodes `input`, gating the latent channels with `features` when the
    /// encoder was built with conditioning. Features are ignored otherwise.
    pub fn encode(&self, input: &FeatureMap, features: Option<&[f32]>) -> Result<FeatureMap> {
        let mut latent = self.forward(input)?;
        if let (Some(gate), Some(features)) = (&self.conditioning, features) {
            latent.scale_channels(&gate.gates(features)?)?;
        }
        Ok(latent)
    }
}

impl Module for WaveformEncoder {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let mut blocks = self.blocks.iter();
        let first = blocks
            .next()
            .ok_or_else(|| LofiError::msg("encoder has no layers"))?;
        let mut x = first.forward(input)?;
        for block in blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    fn parameter_count(&self) -> usize {
        let gate = self.conditioning.as_ref().map_or(0, |gate| {
            gate.hidden.parameter_count() + gate.output.parameter_count()
        });
        self.blocks.iter().map(Module::parameter_count).sum::<usize>() + gate
    }
}

fn block_stride(layer: usize, layers: usize) -> usize {
    if layer + 1 < layers {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn arch(feature_dim: Option<usize>) -> ModelArchitecture {
        ModelArchitecture {
            base_channels: 2,
            num_encoder_layers: 4,
            max_channels: 8,
            feature_dim,
            ..ModelArchitecture::default()
        }
    }

    #[test]
    fn halves_length_per_strided_layer() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let encoder = WaveformEncoder::init(&mut rng, &arch(None));
        let input = FeatureMap::from_mono(&[0.25; 64], 1);
        let latent = encoder.encode(&input, None).unwrap();
        assert_eq!(latent.channels(), 8);
        assert_eq!(latent.frames(), 8);
        let residual: Vec<bool> = encoder.blocks().iter().map(ConvBlock::has_residual).collect();
        // Only the stride-1 tail with matching widths keeps its skip path.
        assert_eq!(residual, vec![false, false, false, true]);
    }

    #[test]
    fn gates_stay_in_unit_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let encoder = WaveformEncoder::init(&mut rng, &arch(Some(3)));
        let gates = encoder
            .conditioning
            .as_ref()
            .unwrap()
            .gates(&[100.0, -100.0, 0.5])
            .unwrap();
        assert_eq!(gates.len(), 8);
        assert!(gates.iter().all(|g| (0.0..=1.0).contains(g)));
    }

    #[test]
    fn export_uses_state_dict_names() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let encoder = WaveformEncoder::init(&mut rng, &arch(Some(3)));
        let mut store = TensorStore::new();
        encoder.export(&mut store);
        assert_eq!(store.shape("encoder.layers.0.conv.weight"), Some(&[2, 1, 3][..]));
        assert_eq!(store.shape("encoder.layers.3.bn.running_var"), Some(&[8][..]));
        assert_eq!(store.shape("encoder.feature_conditioning.0.weight"), Some(&[128, 3][..]));
        assert_eq!(store.shape("encoder.feature_conditioning.2.bias"), Some(&[8][..]));
    }
}
