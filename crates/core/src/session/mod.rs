//! Explicitly owned processing session.
//!
//! A session resolves the device, loads the model once and builds the
//! orchestrator. Every entry point borrows it immutably, so callers may
//! share one session across threads.

use std::{path::Path, sync::Arc};

use serde::Serialize;

use crate::{
    audio,
    config::AppConfig,
    model::{load_checkpoint, ArchitectureConfig, LofiNet},
    pipeline::{Device, Estimate, ParameterSource, TransformOrchestrator, TransformStrategy},
    segment::Segmenter,
    EffectParameters, FeatureVector, LofiError, MoodRuleEngine, Result,
};

/// Result of [`Session::analyze`].
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub parameters: EffectParameters,
    pub source: ParameterSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood_logits: Option<Vec<f32>>,
    pub features: FeatureVector,
}

/// Summary of one [`Session::generate`] call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    pub parameters: EffectParameters,
    pub source: ParameterSource,
    pub strategy: TransformStrategy,
    pub samples: usize,
    pub sample_rate: u32,
}

#[derive(Debug)]
pub struct Session {
    config: AppConfig,
    device: Device,
    orchestrator: TransformOrchestrator,
}

impl Session {
    /// Builds a session from configuration, loading the model when both a
    /// checkpoint and an architecture file are configured.
    pub fn load(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let device = Device::resolve(config.model.device);
        let model = match (&config.model.checkpoint, &config.model.architecture) {
            (Some(checkpoint), Some(architecture)) => {
                Some(load_model(checkpoint, architecture)?)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(LofiError::input(
                    "session",
                    "a checkpoint needs an architecture config",
                ))
            }
            (None, Some(_)) => {
                return Err(LofiError::input(
                    "session",
                    "an architecture config needs a checkpoint",
                ))
            }
        };
        Self::build(config, device, model.map(Arc::new))
    }

    /// Session around an already built model.
    pub fn with_model(config: &AppConfig, model: LofiNet) -> Result<Self> {
        config.validate()?;
        let device = Device::resolve(config.model.device);
        Self::build(config, device, Some(Arc::new(model)))
    }

    /// Session that always uses the rules and the effect chain.
    pub fn dsp_only(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Self::build(config, Device::Cpu, None)
    }

    fn build(config: &AppConfig, device: Device, model: Option<Arc<LofiNet>>) -> Result<Self> {
        let segmenter = Segmenter::new(config.audio.segment_length, config.audio.overlap)?;
        let orchestrator = TransformOrchestrator::new(
            model,
            config.model.use_neural_model,
            segmenter,
            MoodRuleEngine::new(config.rules.clone()),
        );
        tracing::info!(
            %device,
            strategy = ?orchestrator.strategy(),
            parameters = ?orchestrator.parameter_source(),
            sample_rate = config.audio.sample_rate,
            "session ready"
        );
        Ok(Self {
            config: config.clone(),
            device,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn orchestrator(&self) -> &TransformOrchestrator {
        &self.orchestrator
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.audio.sample_rate
    }

    pub fn transform(
        &self,
        waveform: &[f32],
        sample_rate: u32,
        parameters: Option<EffectParameters>,
    ) -> Result<Vec<f32>> {
        self.orchestrator.transform(waveform, sample_rate, parameters)
    }

    /// Reads `input`, transforms it and writes the result to `output`.
    pub fn generate(
        &self,
        input: &Path,
        output: &Path,
        parameters: Option<EffectParameters>,
    ) -> Result<GenerateReport> {
        let sample_rate = self.sample_rate();
        let waveform = audio::read_wav(input, sample_rate)?;
        let transformed = self.orchestrator.process(&waveform, sample_rate, parameters)?;
        audio::write_wav(output, &transformed.samples, sample_rate)?;

        let Estimate {
            parameters, source, ..
        } = transformed.estimate;
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            strategy = ?transformed.strategy,
            mood = %parameters.mood(),
            "generated lofi track"
        );
        Ok(GenerateReport {
            parameters,
            source,
            strategy: transformed.strategy,
            samples: transformed.samples.len(),
            sample_rate,
        })
    }

    /// [`Session::generate`] with caller supplied parameters.
    pub fn generate_from_parameters(
        &self,
        input: &Path,
        output: &Path,
        parameters: EffectParameters,
    ) -> Result<GenerateReport> {
        self.generate(input, output, Some(parameters))
    }

    /// Extracts features from `input` and the parameters they imply.
    pub fn analyze(&self, input: &Path) -> Result<AnalysisReport> {
        let sample_rate = self.sample_rate();
        let waveform = audio::read_wav(input, sample_rate)?;
        self.analyze_waveform(&waveform, sample_rate)
    }

    pub fn analyze_waveform(&self, waveform: &[f32], sample_rate: u32) -> Result<AnalysisReport> {
        let features = self.orchestrator.features(waveform, sample_rate)?;
        let estimate = self.orchestrator.estimate(&features)?;
        Ok(AnalysisReport {
            parameters: estimate.parameters,
            source: estimate.source,
            mood_logits: estimate.mood_logits,
            features,
        })
    }

    /// Ends the session and releases the model.
    pub fn close(self) {
        tracing::debug!(device = %self.device, "session closed");
    }
}

fn load_model(checkpoint: &Path, architecture: &Path) -> Result<LofiNet> {
    let config = ArchitectureConfig::load(architecture)?;
    let model = load_checkpoint(config.model_architecture, checkpoint)?;
    if config.num_parameters != 0 && config.num_parameters != model.num_parameters() {
        tracing::warn!(
            declared = config.num_parameters,
            actual = model.num_parameters(),
            "architecture config parameter count is stale"
        );
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::FEATURE_COUNT,
        config::DeviceRequest,
        model::{save_checkpoint, ModelArchitecture},
        Mood,
    };

    fn tiny_architecture() -> ModelArchitecture {
        ModelArchitecture {
            base_channels: 4,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            max_channels: 8,
            feature_dim: Some(FEATURE_COUNT),
            ..ModelArchitecture::default()
        }
    }

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.segment_length = 4_096;
        config
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.4).collect()
    }

    #[test]
    fn loads_model_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let net = LofiNet::new_seeded(tiny_architecture(), 5).unwrap();
        let checkpoint = dir.path().join("model.ckpt");
        let arch_path = dir.path().join("arch.json");
        save_checkpoint(&net, &checkpoint).unwrap();
        ArchitectureConfig::new(tiny_architecture(), net.num_parameters())
            .save(&arch_path)
            .unwrap();

        let mut config = small_config();
        config.model.checkpoint = Some(checkpoint);
        config.model.architecture = Some(arch_path);
        config.model.use_neural_model = true;
        let session = Session::load(&config).unwrap();
        assert_eq!(session.orchestrator().strategy(), TransformStrategy::Neural);
        assert_eq!(session.orchestrator().parameter_source(), ParameterSource::Predictor);
        session.close();
    }

    #[test]
    fn checkpoint_without_architecture_is_rejected() {
        let mut config = small_config();
        config.model.checkpoint = Some("model.ckpt".into());
        assert!(matches!(Session::load(&config), Err(LofiError::Input { .. })));
    }

    #[test]
    fn accelerator_request_still_builds_a_session() {
        let mut config = small_config();
        config.model.device = DeviceRequest::Accelerator;
        let session = Session::load(&config).unwrap();
        assert_eq!(session.device(), Device::Cpu);
    }

    #[test]
    fn analyze_reports_rules_without_model() {
        let session = Session::dsp_only(&small_config()).unwrap();
        let report = session.analyze_waveform(&tone(22_050), 22_050).unwrap();
        assert_eq!(report.source, ParameterSource::Rules);
        assert_eq!(report.features.len(), FEATURE_COUNT);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["features"]["tempo"].is_number());
        assert!(json.get("mood_logits").is_none());
    }

    #[test]
    fn with_model_uses_predictor_for_analysis() {
        let net = LofiNet::new_seeded(tiny_architecture(), 8).unwrap();
        let session = Session::with_model(&small_config(), net).unwrap();
        assert_eq!(session.orchestrator().strategy(), TransformStrategy::Dsp);
        let report = session.analyze_waveform(&tone(11_025), 22_050).unwrap();
        assert_eq!(report.source, ParameterSource::Predictor);
        assert_eq!(report.mood_logits.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn generate_round_trips_through_wav() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out").join("lofi.wav");
        audio::write_wav(&input, &tone(22_050), 22_050).unwrap();

        let session = Session::dsp_only(&small_config()).unwrap();
        let params = EffectParameters::new(70.0, 30.0, 60.0, Mood::Focus);
        let report = session.generate_from_parameters(&input, &output, params).unwrap();
        assert_eq!(report.samples, 22_050);
        assert_eq!(report.source, ParameterSource::Supplied);
        assert_eq!(report.strategy, TransformStrategy::Dsp);
        let written = audio::read_wav(&output, 22_050).unwrap();
        assert_eq!(written.len(), 22_050);
    }
}
