//! Routing between the neural transform and the effect chain.
//!
//! Both decisions (how audio is transformed, where parameters come from)
//! are made once when the orchestrator is built and never re-examined per
//! call.

use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::{
    config::DeviceRequest,
    error::ensure_finite,
    model::LofiNet,
    segment::{self, Segmenter},
    EffectChain, EffectParameters, FeatureExtractor, FeatureVector, LofiError, MoodRuleEngine,
    Result,
};

/// Where tensors live for the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
}

impl Device {
    /// Claims the requested device. Only host execution is built in, so an
    /// accelerator request fails with [`LofiError::Resource`].
    pub fn acquire(request: DeviceRequest) -> Result<Self> {
        match request {
            DeviceRequest::Cpu => Ok(Device::Cpu),
            DeviceRequest::Accelerator => Err(LofiError::Resource(
                "no accelerator backend is available in this build".into(),
            )),
        }
    }

    /// Like [`Device::acquire`] but degrades to the host CPU.
    pub fn resolve(request: DeviceRequest) -> Self {
        Self::acquire(request).unwrap_or_else(|err| {
            tracing::warn!(%err, "falling back to cpu");
            Device::Cpu
        })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// How waveforms are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformStrategy {
    /// Segment, run the encoder/decoder, overlap-add.
    Neural,
    /// Parameter driven effect chain.
    Dsp,
}

/// Where effect parameters come from when the caller does not supply them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterSource {
    Supplied,
    Predictor,
    Rules,
}

/// Parameters chosen for one waveform and how they were obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub parameters: EffectParameters,
    pub source: ParameterSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood_logits: Option<Vec<f32>>,
}

/// Output of one transform call.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub samples: Vec<f32>,
    pub estimate: Estimate,
    /// Path that actually produced `samples`; differs from the configured
    /// strategy when the neural path fell back.
    pub strategy: TransformStrategy,
}

/// Single entry point for turning a waveform into its lofi rendition.
#[derive(Debug, Clone)]
pub struct TransformOrchestrator {
    model: Option<Arc<LofiNet>>,
    strategy: TransformStrategy,
    source: ParameterSource,
    segmenter: Segmenter,
    extractor: FeatureExtractor,
    rules: MoodRuleEngine,
    chain: EffectChain,
}

impl TransformOrchestrator {
    /// `prefer_neural` only takes effect when a model is supplied. The
    /// predictor is used whenever the model carries one.
    pub fn new(
        model: Option<Arc<LofiNet>>,
        prefer_neural: bool,
        segmenter: Segmenter,
        rules: MoodRuleEngine,
    ) -> Self {
        let strategy = match (&model, prefer_neural) {
            (Some(_), true) => TransformStrategy::Neural,
            (None, true) => {
                tracing::warn!("neural transform requested without a model, using effect chain");
                TransformStrategy::Dsp
            }
            (_, false) => TransformStrategy::Dsp,
        };
        let source = match model.as_deref().and_then(LofiNet::predictor) {
            Some(_) => ParameterSource::Predictor,
            None => ParameterSource::Rules,
        };
        tracing::debug!(?strategy, ?source, "transform orchestrator ready");
        Self {
            model,
            strategy,
            source,
            segmenter,
            extractor: FeatureExtractor::new(),
            rules,
            chain: EffectChain::new(),
        }
    }

    pub fn strategy(&self) -> TransformStrategy {
        self.strategy
    }

    pub fn parameter_source(&self) -> ParameterSource {
        self.source
    }

    pub fn model(&self) -> Option<&LofiNet> {
        self.model.as_deref()
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn features(&self, waveform: &[f32], sample_rate: u32) -> Result<FeatureVector> {
        self.extractor.extract(waveform, sample_rate)
    }

    /// Picks parameters from the predictor when one is bound, otherwise
    /// from the rule engine. A predictor failure drops to the rules.
    pub fn estimate(&self, features: &FeatureVector) -> Result<Estimate> {
        if self.source == ParameterSource::Predictor {
            if let Some(predictor) = self.model().and_then(LofiNet::predictor) {
                match predictor.predict(&features.values()) {
                    Ok(prediction) => {
                        return Ok(Estimate {
                            parameters: prediction.parameters,
                            source: ParameterSource::Predictor,
                            mood_logits: Some(prediction.mood_logits),
                        })
                    }
                    Err(err) => tracing::warn!(%err, "parameter predictor failed, using rules"),
                }
            }
        }
        Ok(Estimate {
            parameters: self.rules.analyze(features)?,
            source: ParameterSource::Rules,
            mood_logits: None,
        })
    }

    pub fn transform(
        &self,
        waveform: &[f32],
        sample_rate: u32,
        parameters: Option<EffectParameters>,
    ) -> Result<Vec<f32>> {
        Ok(self.process(waveform, sample_rate, parameters)?.samples)
    }

    /// Full transform with provenance. The neural path falls back to the
    /// effect chain at most once; an effect chain failure is returned.
    pub fn process(
        &self,
        waveform: &[f32],
        sample_rate: u32,
        parameters: Option<EffectParameters>,
    ) -> Result<Transformed> {
        if waveform.is_empty() {
            return Err(LofiError::input("transform", "waveform is empty"));
        }
        if sample_rate == 0 {
            return Err(LofiError::input("transform", "sample rate must be positive"));
        }
        ensure_finite("transform input", waveform)?;

        let conditioned = self.strategy == TransformStrategy::Neural
            && self.model().is_some_and(|m| m.encoder().is_conditioned());

        let features = if parameters.is_none() {
            Some(self.features(waveform, sample_rate)?)
        } else if conditioned {
            self.features(waveform, sample_rate)
                .map_err(|err| tracing::warn!(%err, "conditioning features unavailable"))
                .ok()
        } else {
            None
        };

        let estimate = match (parameters, &features) {
            (Some(parameters), _) => Estimate {
                parameters,
                source: ParameterSource::Supplied,
                mood_logits: None,
            },
            (None, Some(features)) => self.estimate(features)?,
            (None, None) => return Err(LofiError::msg("features were not extracted")),
        };

        if self.strategy == TransformStrategy::Neural {
            let conditioning = features.as_ref().filter(|_| conditioned).map(FeatureVector::values);
            match self.neural(waveform, conditioning.as_deref()) {
                Ok(samples) => {
                    return Ok(Transformed {
                        samples,
                        estimate,
                        strategy: TransformStrategy::Neural,
                    })
                }
                Err(err) => tracing::warn!(
                    stage = "neural",
                    %err,
                    samples = waveform.len(),
                    "neural transform failed, falling back to effect chain"
                ),
            }
        }

        let samples = self.chain.apply(waveform, sample_rate, &estimate.parameters)?;
        Ok(Transformed {
            samples,
            estimate,
            strategy: TransformStrategy::Dsp,
        })
    }

    fn neural(&self, waveform: &[f32], features: Option<&[f32]>) -> Result<Vec<f32>> {
        let model = self
            .model()
            .ok_or_else(|| LofiError::msg("no model bound to the orchestrator"))?;
        let segments: Vec<Vec<f32>> = self
            .segmenter
            .segment(waveform)
            .into_iter()
            .map(|segment| segment.samples)
            .collect();
        tracing::debug!(
            segments = segments.len(),
            hop = self.segmenter.hop(),
            segment_length = self.segmenter.segment_length(),
            "running neural transform"
        );
        let processed = model.transform_batch(&segments, features)?;
        let output = segment::reconstruct(
            &processed,
            waveform.len(),
            self.segmenter.segment_length(),
            self.segmenter.hop(),
        )?;
        ensure_finite("overlap-add", &output)?;
        Ok(output)
    }
}
