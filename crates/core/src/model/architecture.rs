use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{LofiError, Result};

/// Hyperparameters that fix every tensor shape in a [`super::LofiNet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArchitecture {
    pub input_channels: usize,
    pub output_channels: usize,
    pub base_channels: usize,
    pub kernel_size: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub max_channels: usize,
    /// Length of the conditioning feature vector. `None` builds the model
    /// without feature gating and without a parameter predictor.
    pub feature_dim: Option<usize>,
    /// Width of the predictor's mood-logit head.
    pub mood_classes: usize,
}

impl Default for ModelArchitecture {
    fn default() -> Self {
        Self {
            input_channels: 1,
            output_channels: 1,
            base_channels: 32,
            kernel_size: 3,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            max_channels: 256,
            feature_dim: None,
            mood_classes: 1,
        }
    }
}

impl ModelArchitecture {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("input_channels", self.input_channels),
            ("output_channels", self.output_channels),
            ("base_channels", self.base_channels),
            ("kernel_size", self.kernel_size),
            ("num_encoder_layers", self.num_encoder_layers),
            ("num_decoder_layers", self.num_decoder_layers),
            ("max_channels", self.max_channels),
            ("mood_classes", self.mood_classes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(LofiError::input("architecture", format!("{field} must be positive")));
            }
        }
        if self.kernel_size % 2 == 0 {
            return Err(LofiError::input(
                "architecture",
                format!("kernel_size {} must be odd", self.kernel_size),
            ));
        }
        if self.feature_dim == Some(0) {
            return Err(LofiError::input("architecture", "feature_dim must be positive"));
        }
        Ok(())
    }

    /// Channel width of the `layer`-th encoder block: `base * 2^layer`,
    /// capped at `max_channels`.
    pub fn encoder_channels(&self, layer: usize) -> usize {
        let mut channels = self.base_channels;
        for _ in 0..layer {
            if channels >= self.max_channels {
                break;
            }
            channels = channels.saturating_mul(2);
        }
        channels.min(self.max_channels)
    }

    /// Channel width of the latent produced by the encoder.
    pub fn latent_channels(&self) -> usize {
        self.encoder_channels(self.num_encoder_layers.saturating_sub(1))
    }

    /// Output width of decoder stage `stage`. The last stage emits
    /// `output_channels`; earlier stages mirror the encoder widths.
    pub fn decoder_channels(&self, stage: usize) -> usize {
        if stage + 1 == self.num_decoder_layers {
            self.output_channels
        } else {
            self.encoder_channels(self.num_decoder_layers - stage - 1)
        }
    }
}

/// On-disk companion of a checkpoint describing how it was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub model_architecture: ModelArchitecture,
    #[serde(default)]
    pub training_params: serde_json::Value,
    #[serde(default)]
    pub num_parameters: usize,
}

impl ArchitectureConfig {
    pub fn new(model_architecture: ModelArchitecture, num_parameters: usize) -> Self {
        Self {
            model_architecture,
            training_params: serde_json::Value::Object(Default::default()),
            num_parameters,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.model_architecture.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_schedule_doubles_then_caps() {
        let arch = ModelArchitecture::default();
        let widths: Vec<usize> = (0..6).map(|i| arch.encoder_channels(i)).collect();
        assert_eq!(widths, vec![32, 64, 128, 256, 256, 256]);
        assert_eq!(arch.latent_channels(), 256);
        let decoder: Vec<usize> = (0..6).map(|i| arch.decoder_channels(i)).collect();
        assert_eq!(decoder, vec![256, 256, 256, 128, 64, 1]);
    }

    #[test]
    fn rejects_even_kernels_and_empty_stacks() {
        let even = ModelArchitecture {
            kernel_size: 4,
            ..ModelArchitecture::default()
        };
        assert!(even.validate().is_err());
        let shallow = ModelArchitecture {
            num_encoder_layers: 0,
            ..ModelArchitecture::default()
        };
        assert!(shallow.validate().is_err());
        assert!(ModelArchitecture::default().validate().is_ok());
    }

    #[test]
    fn parses_trainer_output_with_missing_fields() {
        let json = r#"{
            "model_architecture": {"base_channels": 16, "feature_dim": 36},
            "training_params": {"learning_rate": 0.001},
            "num_parameters": 1234
        }"#;
        let config: ArchitectureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model_architecture.base_channels, 16);
        assert_eq!(config.model_architecture.feature_dim, Some(36));
        assert_eq!(config.model_architecture.kernel_size, 3);
        assert_eq!(config.num_parameters, 1234);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("arch.json");
        let config = ArchitectureConfig::new(ModelArchitecture::default(), 42);
        config.save(&path).unwrap();
        assert_eq!(ArchitectureConfig::load(&path).unwrap(), config);
    }
}
