//! Convolutional waveform model.
//!
//! Every learned component implements [`Module`] and owns its parameters
//! outright. [`LofiNet`] ties an encoder, a decoder and an optional
//! parameter predictor together and is immutable once built, so a single
//! instance can be shared across threads for concurrent inference.

mod architecture;
mod checkpoint;
mod decoder;
mod encoder;
mod layers;
mod predictor;

pub use architecture::{ArchitectureConfig, ModelArchitecture};
pub use checkpoint::{CheckpointRecord, TensorStore};
pub use decoder::{DecoderStage, WaveformDecoder};
pub use encoder::WaveformEncoder;
pub use layers::{gelu, relu, sigmoid, upsample2, BatchNorm1d, Conv1d, ConvBlock, Linear};
pub use predictor::{ParameterPredictor, Prediction};

use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{error::ensure_finite, LofiError, Result};

/// A learned transform from one feature map to another.
pub trait Module {
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap>;

    /// Number of trainable values owned by the module.
    fn parameter_count(&self) -> usize;
}

/// Channel-major activation tensor for a single item: `data[c * frames + t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    channels: usize,
    frames: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn zeros(channels: usize, frames: usize) -> Self {
        Self {
            channels,
            frames,
            data: vec![0.0; channels * frames],
        }
    }

    /// Builds a map from equally long per-channel rows.
    pub fn from_channels(rows: Vec<Vec<f32>>) -> Result<Self> {
        let channels = rows.len();
        let frames = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != frames) {
            return Err(LofiError::input("feature map", "channel rows differ in length"));
        }
        Ok(Self {
            channels,
            frames,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Copies a mono signal into every one of `channels` rows.
    pub fn from_mono(samples: &[f32], channels: usize) -> Self {
        let mut data = Vec::with_capacity(samples.len() * channels);
        for _ in 0..channels {
            data.extend_from_slice(samples);
        }
        Self {
            channels,
            frames: samples.len(),
            data,
        }
    }

    /// A `[len, 1]` map holding one vector, for per-frame dense layers.
    pub fn from_vector(values: &[f32]) -> Self {
        Self {
            channels: values.len(),
            frames: 1,
            data: values.to_vec(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn channel(&self, c: usize) -> &[f32] {
        &self.data[c * self.frames..(c + 1) * self.frames]
    }

    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        &mut self.data[c * self.frames..(c + 1) * self.frames]
    }

    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        self.data.iter_mut().for_each(|v| *v = f(*v));
    }

    pub fn add_assign(&mut self, other: &FeatureMap) -> Result<()> {
        if self.channels != other.channels || self.frames != other.frames {
            return Err(LofiError::input(
                "feature map",
                format!(
                    "cannot add {}x{} to {}x{}",
                    other.channels, other.frames, self.channels, self.frames
                ),
            ));
        }
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    /// Multiplies every channel by its gate.
    pub fn scale_channels(&mut self, gates: &[f32]) -> Result<()> {
        if gates.len() != self.channels {
            return Err(LofiError::input(
                "feature map",
                format!("{} gates for {} channels", gates.len(), self.channels),
            ));
        }
        for (c, gate) in gates.iter().enumerate() {
            self.channel_mut(c).iter_mut().for_each(|v| *v *= gate);
        }
        Ok(())
    }

    /// Mean over channels, giving a mono signal.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.data.clone();
        }
        let inv = 1.0 / self.channels.max(1) as f32;
        (0..self.frames)
            .map(|t| (0..self.channels).map(|c| self.channel(c)[t]).sum::<f32>() * inv)
            .collect()
    }
}

/// Encoder, decoder and optional parameter head.
#[derive(Debug, Clone)]
pub struct LofiNet {
    architecture: ModelArchitecture,
    encoder: WaveformEncoder,
    decoder: WaveformDecoder,
    predictor: Option<ParameterPredictor>,
}

impl LofiNet {
    /// Builds a network with deterministic pseudo-random initial weights.
    pub fn new_seeded(architecture: ModelArchitecture, seed: u64) -> Result<Self> {
        architecture.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let encoder = WaveformEncoder::init(&mut rng, &architecture);
        let decoder = WaveformDecoder::init(&mut rng, &architecture);
        let predictor = architecture
            .feature_dim
            .map(|dim| ParameterPredictor::init(&mut rng, dim, architecture.mood_classes));
        Ok(Self {
            architecture,
            encoder,
            decoder,
            predictor,
        })
    }

    /// Instantiates `architecture` and fills it from `record`.
    ///
    /// Every shape is checked here so inference never meets a mismatch.
    pub fn from_checkpoint(architecture: ModelArchitecture, record: CheckpointRecord) -> Result<Self> {
        architecture.validate()?;
        if let Some(saved) = &record.architecture {
            if *saved != architecture {
                return Err(LofiError::mismatch(
                    "architecture",
                    format!("checkpoint was trained as {saved:?}, config declares {architecture:?}"),
                ));
            }
        }

        let mut store = record.tensors;
        let encoder = WaveformEncoder::load(&mut store, &architecture)?;
        let decoder = WaveformDecoder::load(&mut store, &architecture)?;
        let predictor = match architecture.feature_dim {
            Some(dim) => Some(ParameterPredictor::load(
                &mut store,
                dim,
                architecture.mood_classes,
            )?),
            None => None,
        };
        store.finish()?;

        Ok(Self {
            architecture,
            encoder,
            decoder,
            predictor,
        })
    }

    /// Snapshot of the weights as a checkpoint record with no training
    /// metadata attached.
    pub fn to_checkpoint(&self) -> CheckpointRecord {
        let mut store = TensorStore::new();
        self.encoder.export(&mut store);
        self.decoder.export(&mut store);
        if let Some(predictor) = &self.predictor {
            predictor.export(&mut store);
        }
        CheckpointRecord::new(Some(self.architecture.clone()), store)
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    pub fn encoder(&self) -> &WaveformEncoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &WaveformDecoder {
        &self.decoder
    }

    pub fn predictor(&self) -> Option<&ParameterPredictor> {
        self.predictor.as_ref()
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder.parameter_count()
            + self.decoder.parameter_count()
            + self.predictor.as_ref().map_or(0, Module::parameter_count)
    }

    /// Runs one segment through encoder and decoder.
    ///
    /// The result is cropped or zero padded to the segment's length.
    pub fn transform_segment(&self, segment: &[f32], features: Option<&[f32]>) -> Result<Vec<f32>> {
        if segment.is_empty() {
            return Err(LofiError::input("neural transform", "segment is empty"));
        }
        let input = FeatureMap::from_mono(segment, self.architecture.input_channels);
        let latent = self.encoder.encode(&input, features)?;
        let decoded = self.decoder.decode(&latent)?;

        let mut output = decoded.to_mono();
        output.resize(segment.len(), 0.0);
        ensure_finite("neural transform", &output)?;
        Ok(output)
    }

    /// Runs every segment in order. Equivalent to calling
    /// [`LofiNet::transform_segment`] on each.
    pub fn transform_batch(
        &self,
        segments: &[Vec<f32>],
        features: Option<&[f32]>,
    ) -> Result<Vec<Vec<f32>>> {
        segments
            .iter()
            .map(|segment| self.transform_segment(segment, features))
            .collect()
    }
}

/// Writes the network's weights and architecture to `path`.
pub fn save_checkpoint(net: &LofiNet, path: &Path) -> Result<()> {
    net.to_checkpoint().save(path)
}

/// Loads weights from `path` into a network shaped by `architecture`.
pub fn load_checkpoint(architecture: ModelArchitecture, path: &Path) -> Result<LofiNet> {
    let record = CheckpointRecord::load(path)?;
    let net = LofiNet::from_checkpoint(architecture, record)?;
    tracing::info!(
        path = %path.display(),
        parameters = net.num_parameters(),
        conditioned = net.encoder().is_conditioned(),
        "model loaded"
    );
    Ok(net)
}
