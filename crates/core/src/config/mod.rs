use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{LofiError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub model: ModelConfig,
    pub rules: RuleThresholds,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()
    }
}

/// Configuration specific to audio decoding and segmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Window length, in samples, handed to the neural model.
    pub segment_length: usize,
    /// Fraction of each segment shared with its successor, in `[0, 1)`.
    /// Values close to 1 multiply the segment count for little audible gain.
    pub overlap: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            segment_length: 22_050 * 5,
            overlap: 0.1,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(LofiError::input("config", "sample_rate must be positive"));
        }
        if self.segment_length == 0 {
            return Err(LofiError::input("config", "segment_length must be positive"));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(LofiError::input(
                "config",
                format!("overlap must be in [0, 1), got {}", self.overlap),
            ));
        }
        Ok(())
    }
}

/// Where inference should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequest {
    #[default]
    Cpu,
    Accelerator,
}

/// Model locations and routing switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub checkpoint: Option<PathBuf>,
    pub architecture: Option<PathBuf>,
    /// Route audio through the encoder/decoder instead of the effect chain.
    pub use_neural_model: bool,
    pub device: DeviceRequest,
}

/// Band edges and band outputs of the rule based mood analysis.
///
/// These are empirically chosen and kept configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleThresholds {
    /// Upper edges of the first three energy bands, on `rms_mean * 100`.
    pub energy_edges: [f32; 3],
    /// Chill level per energy band, quietest first.
    pub energy_chill: [f32; 4],
    /// Upper edges of the first three tempo bands, in BPM.
    pub tempo_edges: [f32; 3],
    pub tempo_beat: [f32; 4],
    /// Divisor applied to the spectral centroid mean, in Hz.
    pub brightness_reference_hz: f32,
    pub brightness_edges: [f32; 2],
    /// Vintage effect per brightness band, darkest first.
    pub brightness_vintage: [f32; 3],
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            energy_edges: [0.1, 0.2, 0.4],
            energy_chill: [80.0, 70.0, 50.0, 30.0],
            tempo_edges: [80.0, 100.0, 120.0],
            tempo_beat: [30.0, 50.0, 70.0, 85.0],
            brightness_reference_hz: 5_000.0,
            brightness_edges: [0.5, 0.8],
            brightness_vintage: [70.0, 50.0, 30.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"audio": {"overlap": 0.25}}"#).unwrap();
        assert_eq!(config.audio.sample_rate, 22_050);
        assert_eq!(config.audio.overlap, 0.25);
        assert!(!config.model.use_neural_model);
        assert_eq!(config.rules, RuleThresholds::default());
    }

    #[test]
    fn rejects_out_of_range_overlap() {
        let mut config = AppConfig::default();
        config.audio.overlap = 1.0;
        assert!(config.validate().is_err());
        config.audio.overlap = -0.1;
        assert!(config.validate().is_err());
        config.audio.overlap = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_device_names() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"device": "accelerator"}"#).unwrap();
        assert_eq!(config.device, DeviceRequest::Accelerator);
    }
}
