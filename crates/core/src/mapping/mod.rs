use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{config::RuleThresholds, FeatureVector, LofiError, Result};

/// Categorical mood steering the baseline effect intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    #[default]
    Relaxed,
    Focus,
    Sleep,
}

impl Mood {
    /// Label order used by the mood classification logits.
    pub const ALL: [Mood; 3] = [Mood::Relaxed, Mood::Focus, Mood::Sleep];

    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Relaxed => "relaxed",
            Mood::Focus => "focus",
            Mood::Sleep => "sleep",
        }
    }

    /// Resolves classification logits to a label by arg-max. Indices past the
    /// known labels, or an empty slice, resolve to [`Mood::Relaxed`].
    pub fn from_logits(logits: &[f32]) -> Mood {
        logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .and_then(|(index, _)| Self::ALL.get(index).copied())
            .unwrap_or_default()
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = LofiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Ok(Mood::Relaxed),
            "focus" => Ok(Mood::Focus),
            "sleep" => Ok(Mood::Sleep),
            other => Err(LofiError::input(
                "parameters",
                format!("unknown mood `{other}` (expected relaxed, focus or sleep)"),
            )),
        }
    }
}

/// Effect strengths in `[0, 100]` plus the mood label.
///
/// Values are clamped on construction, so a built instance always satisfies
/// the range contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameters")]
pub struct EffectParameters {
    chill_level: f32,
    beat_intensity: f32,
    vintage_effect: f32,
    mood: Mood,
}

impl EffectParameters {
    pub fn new(chill_level: f32, beat_intensity: f32, vintage_effect: f32, mood: Mood) -> Self {
        Self {
            chill_level: clamp_strength(chill_level),
            beat_intensity: clamp_strength(beat_intensity),
            vintage_effect: clamp_strength(vintage_effect),
            mood,
        }
    }

    /// Reads a parameters override file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn chill_level(&self) -> f32 {
        self.chill_level
    }

    pub fn beat_intensity(&self) -> f32 {
        self.beat_intensity
    }

    pub fn vintage_effect(&self) -> f32 {
        self.vintage_effect
    }

    pub fn mood(&self) -> Mood {
        self.mood
    }
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self::new(50.0, 50.0, 50.0, Mood::Relaxed)
    }
}

fn clamp_strength(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[derive(Deserialize)]
struct RawParameters {
    chill_level: f32,
    beat_intensity: f32,
    vintage_effect: f32,
    #[serde(default)]
    mood: Option<String>,
}

impl TryFrom<RawParameters> for EffectParameters {
    type Error = LofiError;

    fn try_from(raw: RawParameters) -> Result<Self> {
        let mood = match raw.mood {
            Some(label) => label.parse()?,
            None => Mood::default(),
        };
        Ok(Self::new(
            raw.chill_level,
            raw.beat_intensity,
            raw.vintage_effect,
            mood,
        ))
    }
}

/// Threshold cascade from clip features to effect parameters.
///
/// Every band maps to a fixed constant; nothing is interpolated.
#[derive(Debug, Clone, Default)]
pub struct MoodRuleEngine {
    thresholds: RuleThresholds,
}

impl MoodRuleEngine {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RuleThresholds {
        &self.thresholds
    }

    pub fn analyze(&self, features: &FeatureVector) -> Result<EffectParameters> {
        let t = &self.thresholds;

        let energy = features.require("rms_mean")? * 100.0;
        let energy_band = band_index(energy, &t.energy_edges);
        let mood = match energy_band {
            0 => Mood::Sleep,
            1 => Mood::Relaxed,
            _ => Mood::Focus,
        };
        let chill = t.energy_chill[energy_band];

        let tempo = features.require("tempo")?;
        let beat = t.tempo_beat[band_index(tempo, &t.tempo_edges)];

        let reference = if t.brightness_reference_hz > 0.0 {
            t.brightness_reference_hz
        } else {
            RuleThresholds::default().brightness_reference_hz
        };
        let brightness = features.require("spectral_centroid_mean")? / reference;
        let vintage = t.brightness_vintage[band_index(brightness, &t.brightness_edges)];

        let params = EffectParameters::new(chill, beat, vintage, mood);
        tracing::debug!(energy, tempo, brightness, ?params, "rule based parameters");
        Ok(params)
    }
}

/// Index of the first band whose upper edge exceeds `value`; values at or
/// past the last edge land in the final band.
fn band_index<const N: usize>(value: f32, edges: &[f32; N]) -> usize {
    edges.iter().position(|edge| value < *edge).unwrap_or(N)
}
