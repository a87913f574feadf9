//! Core library for the lofi transform.
//!
//! A waveform is analysed into a fixed feature vector, turned into effect
//! parameters (rule cascade or learned predictor) and then rendered either
//! by the DSP effect chain or by the segmented encoder/decoder network.
//! Each module owns one stage; [`session::Session`] wires them together.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod effects;
pub mod error;
pub mod mapping;
pub mod model;
pub mod pipeline;
pub mod segment;
pub mod session;

pub use analysis::{FeatureExtractor, FeatureVector, FEATURE_COUNT};
pub use config::{AppConfig, AudioConfig, DeviceRequest, ModelConfig, RuleThresholds};
pub use effects::{Effect, EffectChain};
pub use error::{LofiError, Result};
pub use mapping::{EffectParameters, Mood, MoodRuleEngine};
pub use model::{ArchitectureConfig, LofiNet, ModelArchitecture, ParameterPredictor};
pub use pipeline::{Device, ParameterSource, TransformOrchestrator, TransformStrategy};
pub use segment::{Segment, Segmenter};
pub use session::{AnalysisReport, GenerateReport, Session};
