use rand::Rng;
use serde::Serialize;

use super::{
    checkpoint::TensorStore,
    layers::{relu, sigmoid, Linear},
    FeatureMap, Module,
};
use crate::{error::ensure_finite, EffectParameters, LofiError, Mood, Result};

const HIDDEN: [usize; 2] = [128, 64];
/// Dropout after each hidden layer during training. Identity at inference.
const DROPOUT: [f32; 2] = [0.3, 0.2];
const SCALAR_OUTPUTS: usize = 3;
/// Positions of the linear layers in the trainer's layer list; the
/// activation and dropout slots in between hold no weights.
const LAYER_INDICES: [usize; 3] = [0, 3, 6];

/// Predicted parameters together with the raw mood logits they came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub parameters: EffectParameters,
    pub mood_logits: Vec<f32>,
}

/// Feed-forward head mapping a feature vector to effect parameters.
#[derive(Debug, Clone)]
pub struct ParameterPredictor {
    layers: [Linear; 3],
    mood_classes: usize,
}

impl ParameterPredictor {
    pub(crate) fn init<R: Rng>(rng: &mut R, feature_dim: usize, mood_classes: usize) -> Self {
        Self {
            layers: [
                Linear::init(rng, feature_dim, HIDDEN[0]),
                Linear::init(rng, HIDDEN[0], HIDDEN[1]),
                Linear::init(rng, HIDDEN[1], SCALAR_OUTPUTS + mood_classes),
            ],
            mood_classes,
        }
    }

    pub(crate) fn load(store: &mut TensorStore, feature_dim: usize, mood_classes: usize) -> Result<Self> {
        let dims = [feature_dim, HIDDEN[0], HIDDEN[1], SCALAR_OUTPUTS + mood_classes];
        let layer = |store: &mut TensorStore, i: usize| {
            Linear::load(
                store,
                &format!("param_predictor.network.{}", LAYER_INDICES[i]),
                dims[i],
                dims[i + 1],
            )
        };
        Ok(Self {
            layers: [layer(store, 0)?, layer(store, 1)?, layer(store, 2)?],
            mood_classes,
        })
    }

    pub(crate) fn export(&self, store: &mut TensorStore) {
        for (layer, index) in self.layers.iter().zip(LAYER_INDICES) {
            layer.export(store, &format!("param_predictor.network.{index}"));
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.layers[0].in_dim()
    }

    pub fn dropout(&self) -> [f32; 2] {
        DROPOUT
    }

    /// Deterministic inference: the three scalars pass through a sigmoid
    /// scaled to `[0, 100]`, the remainder are mood logits.
    pub fn predict(&self, features: &[f32]) -> Result<Prediction> {
        if features.len() != self.feature_dim() {
            return Err(LofiError::input(
                "parameter predictor",
                format!(
                    "expected {} features, got {}",
                    self.feature_dim(),
                    features.len()
                ),
            ));
        }
        let outputs = self.forward(&FeatureMap::from_vector(features))?.data().to_vec();
        ensure_finite("parameter predictor", &outputs)?;

        let scaled: Vec<f32> = outputs[..SCALAR_OUTPUTS]
            .iter()
            .map(|&x| sigmoid(x) * 100.0)
            .collect();
        let mood_logits = outputs[SCALAR_OUTPUTS..].to_vec();
        debug_assert_eq!(mood_logits.len(), self.mood_classes);
        let parameters = EffectParameters::new(
            scaled[0],
            scaled[1],
            scaled[2],
            Mood::from_logits(&mood_logits),
        );
        Ok(Prediction {
            parameters,
            mood_logits,
        })
    }
}

impl Module for ParameterPredictor {
    /// Treats each frame of `input` as an independent feature vector.
    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let [first, second, head] = &self.layers;
        let mut hidden = first.forward(input)?;
        hidden.map_in_place(relu);
        let mut hidden = second.forward(&hidden)?;
        hidden.map_in_place(relu);
        head.forward(&hidden)
    }

    fn parameter_count(&self) -> usize {
        self.layers.iter().map(Module::parameter_count).sum()
    }
}
