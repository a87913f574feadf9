use rand::Rng;

use super::{
    checkpoint::TensorStore,
    layers::{upsample2, ConvBlock},
    FeatureMap, ModelArchitecture, Module,
};
use crate::{LofiError, Result};

const DECODER_DROPOUT: f32 = 0.1;

/// One entry of the decoder stack. Upsampling stages hold no parameters
/// but still occupy a slot in the `decoder.layers.{n}` numbering.
#[derive(Debug, Clone)]
pub enum DecoderStage {
    Upsample,
    Block(ConvBlock),
}

impl Module for DecoderStage {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        match self {
            DecoderStage::Upsample => Ok(upsample2(input)),
            DecoderStage::Block(block) => block.forward(input),
        }
    }

    fn parameter_count(&self) -> usize {
        match self {
            DecoderStage::Upsample => 0,
            DecoderStage::Block(block) => block.parameter_count(),
        }
    }
}

/// Upsampling decoder mirroring the encoder. The final block has neither
/// batch norm nor dropout and its output is squashed with `tanh`.
#[derive(Debug, Clone)]
pub struct WaveformDecoder {
    stages: Vec<DecoderStage>,
}

/// Per block: (input channels, output channels, is last block).
fn block_plan(arch: &ModelArchitecture) -> Vec<(usize, usize, bool)> {
    let mut in_ch = arch.latent_channels();
    (0..arch.num_decoder_layers)
        .map(|stage| {
            let out_ch = arch.decoder_channels(stage);
            let plan = (in_ch, out_ch, stage + 1 == arch.num_decoder_layers);
            in_ch = out_ch;
            plan
        })
        .collect()
}

impl WaveformDecoder {
    pub(crate) fn init<R: Rng>(rng: &mut R, arch: &ModelArchitecture) -> Self {
        let mut stages = Vec::new();
        for (in_ch, out_ch, last) in block_plan(arch) {
            if !last {
                stages.push(DecoderStage::Upsample);
            }
            let dropout = if last { 0.0 } else { DECODER_DROPOUT };
            stages.push(DecoderStage::Block(ConvBlock::init(
                rng,
                in_ch,
                out_ch,
                arch.kernel_size,
                1,
                !last,
                dropout,
            )));
        }
        Self { stages }
    }

    pub(crate) fn load(store: &mut TensorStore, arch: &ModelArchitecture) -> Result<Self> {
        let mut stages = Vec::new();
        for (in_ch, out_ch, last) in block_plan(arch) {
            if !last {
                stages.push(DecoderStage::Upsample);
            }
            let dropout = if last { 0.0 } else { DECODER_DROPOUT };
            let prefix = format!("decoder.layers.{}", stages.len());
            stages.push(DecoderStage::Block(ConvBlock::load(
                store,
                &prefix,
                in_ch,
                out_ch,
                arch.kernel_size,
                1,
                !last,
                dropout,
            )?));
        }
        Ok(Self { stages })
    }

    pub(crate) fn export(&self, store: &mut TensorStore) {
        for (index, stage) in self.stages.iter().enumerate() {
            if let DecoderStage::Block(block) = stage {
                block.export(store, &format!("decoder.layers.{index}"));
            }
        }
    }

    pub fn stages(&self) -> &[DecoderStage] {
        &self.stages
    }

    /// Decodes a latent map to a waveform map bounded to `[-1, 1]`.
    pub fn decode(&self, latent: &FeatureMap) -> Result<FeatureMap> {
        let mut out = self.forward(latent)?;
        out.map_in_place(f32::tanh);
        Ok(out)
    }
}

impl Module for WaveformDecoder {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let mut stages = self.stages.iter();
        let first = stages
            .next()
            .ok_or_else(|| LofiError::msg("decoder has no layers"))?;
        let mut x = first.forward(input)?;
        for stage in stages {
            x = stage.forward(&x)?;
        }
        Ok(x)
    }

    fn parameter_count(&self) -> usize {
        self.stages.iter().map(Module::parameter_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn arch() -> ModelArchitecture {
        ModelArchitecture {
            base_channels: 2,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            max_channels: 8,
            ..ModelArchitecture::default()
        }
    }

    #[test]
    fn stage_layout_interleaves_upsampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let decoder = WaveformDecoder::init(&mut rng, &arch());
        let kinds: Vec<&str> = decoder
            .stages()
            .iter()
            .map(|stage| match stage {
                DecoderStage::Upsample => "up",
                DecoderStage::Block(_) => "block",
            })
            .collect();
        assert_eq!(kinds, vec!["up", "block", "up", "block", "block"]);

        let mut store = TensorStore::new();
        decoder.export(&mut store);
        assert!(store.contains("decoder.layers.1.bn.running_mean"));
        assert!(store.contains("decoder.layers.3.conv.weight"));
        assert_eq!(store.shape("decoder.layers.4.conv.weight"), Some(&[1, 4, 3][..]));
        assert!(!store.contains("decoder.layers.4.bn.weight"));
    }

    #[test]
    fn output_is_bounded_and_upsampled() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let decoder = WaveformDecoder::init(&mut rng, &arch());
        let mut latent = FeatureMap::zeros(8, 5);
        latent.map_in_place(|_| 3.0);
        let out = decoder.decode(&latent).unwrap();
        assert_eq!(out.channels(), 1);
        assert_eq!(out.frames(), 20);
        assert!(out.data().iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
