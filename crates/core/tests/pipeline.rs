use std::f32::consts::TAU;

use approx::assert_abs_diff_eq;
use lofi_core::{
    audio,
    model::{load_checkpoint, save_checkpoint, CheckpointRecord},
    AppConfig, ArchitectureConfig, EffectChain, EffectParameters, FeatureExtractor, LofiError,
    LofiNet, ModelArchitecture, Mood, MoodRuleEngine, ParameterSource, RuleThresholds, Segmenter,
    Session, TransformStrategy, FEATURE_COUNT,
};

const SR: u32 = 22_050;

fn sine(freq: f32, seconds: f32) -> Vec<f32> {
    let len = (seconds * SR as f32) as usize;
    (0..len)
        .map(|i| (TAU * freq * i as f32 / SR as f32).sin() * 0.5)
        .collect()
}

fn small_architecture(feature_dim: Option<usize>) -> ModelArchitecture {
    ModelArchitecture {
        base_channels: 4,
        num_encoder_layers: 3,
        num_decoder_layers: 3,
        max_channels: 8,
        feature_dim,
        ..ModelArchitecture::default()
    }
}

#[test]
fn ten_second_sine_through_effect_chain() {
    let input = sine(440.0, 10.0);
    let params = EffectParameters::new(50.0, 50.0, 50.0, Mood::Relaxed);
    let output = EffectChain::new().apply(&input, SR, &params).unwrap();
    assert_eq!(output.len(), 220_500);
    assert!(audio::peak(&output) <= 1.0);
    assert_ne!(output, input);
}

#[test]
fn rule_and_effect_outputs_stay_in_contract() {
    let extractor = FeatureExtractor::new();
    let rules = MoodRuleEngine::new(RuleThresholds::default());
    for (freq, gain) in [(110.0, 0.05), (440.0, 0.5), (3_000.0, 0.9)] {
        let input: Vec<f32> = sine(freq, 1.0).into_iter().map(|s| s * gain * 2.0).collect();
        let features = extractor.extract(&input, SR).unwrap();
        assert_eq!(features.len(), FEATURE_COUNT);
        let params = rules.analyze(&features).unwrap();
        for value in [
            params.chill_level(),
            params.beat_intensity(),
            params.vintage_effect(),
        ] {
            assert!((0.0..=100.0).contains(&value));
        }
        let output = EffectChain::new().apply(&input, SR, &params).unwrap();
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|s| s.abs() <= 1.0));
    }
}

#[test]
fn segment_round_trip_is_identity_without_overlap() {
    let input = sine(330.0, 0.5);
    let segmenter = Segmenter::new(1_000, 0.0).unwrap();
    let segments: Vec<Vec<f32>> = segmenter
        .segment(&input)
        .into_iter()
        .map(|segment| segment.samples)
        .collect();
    let output = segmenter.reconstruct(&segments, input.len()).unwrap();
    for (a, b) in output.iter().zip(&input) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn checkpoint_files_restore_the_same_transform() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights").join("lofi.ckpt");
    let net = LofiNet::new_seeded(small_architecture(Some(FEATURE_COUNT)), 42).unwrap();
    save_checkpoint(&net, &path).unwrap();

    let restored = load_checkpoint(small_architecture(Some(FEATURE_COUNT)), &path).unwrap();
    let segment = sine(220.0, 0.1);
    let features = vec![0.25; FEATURE_COUNT];
    assert_eq!(
        net.transform_segment(&segment, Some(&features)).unwrap(),
        restored.transform_segment(&segment, Some(&features)).unwrap()
    );
}

#[test]
fn mismatched_checkpoint_fails_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.ckpt");
    let net = LofiNet::new_seeded(small_architecture(None), 1).unwrap();
    let mut record = net.to_checkpoint();
    record.architecture = None;
    record.save(&path).unwrap();

    let err = load_checkpoint(small_architecture(Some(10)), &path).unwrap_err();
    assert!(matches!(err, LofiError::ConfigMismatch { .. }), "{err}");

    let reloaded = CheckpointRecord::load(&path).unwrap();
    assert!(reloaded.tensors.contains("encoder.layers.0.conv.weight"));
}

#[test]
fn neural_session_generates_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("model.ckpt");
    let arch_path = dir.path().join("arch.json");
    let net = LofiNet::new_seeded(small_architecture(Some(FEATURE_COUNT)), 7).unwrap();
    save_checkpoint(&net, &checkpoint).unwrap();
    ArchitectureConfig::new(small_architecture(Some(FEATURE_COUNT)), net.num_parameters())
        .save(&arch_path)
        .unwrap();

    let mut config = AppConfig::default();
    config.audio.segment_length = 8_192;
    config.model.checkpoint = Some(checkpoint);
    config.model.architecture = Some(arch_path);
    config.model.use_neural_model = true;
    let session = Session::load(&config).unwrap();

    let input_path = dir.path().join("in.wav");
    audio::write_wav(&input_path, &sine(440.0, 1.0), SR).unwrap();
    let first = session
        .generate(&input_path, &dir.path().join("a.wav"), None)
        .unwrap();
    let second = session
        .generate(&input_path, &dir.path().join("b.wav"), None)
        .unwrap();
    assert_eq!(first.strategy, TransformStrategy::Neural);
    assert_eq!(first.source, ParameterSource::Predictor);
    assert_eq!(first.samples, SR as usize);

    let a = audio::read_wav(&dir.path().join("a.wav"), SR).unwrap();
    let b = audio::read_wav(&dir.path().join("b.wav"), SR).unwrap();
    assert_eq!(a, b);
    assert!(audio::peak(&a) <= 1.0);
    assert_eq!(first.parameters, second.parameters);
}

#[test]
fn analyze_reads_wav_and_reports_features() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("quiet.wav");
    let quiet: Vec<f32> = sine(200.0, 2.0).into_iter().map(|s| s * 0.05).collect();
    audio::write_wav(&input_path, &quiet, SR).unwrap();

    let session = Session::dsp_only(&AppConfig::default()).unwrap();
    let report = session.analyze(&input_path).unwrap();
    assert_eq!(report.source, ParameterSource::Rules);
    assert_eq!(report.features.len(), FEATURE_COUNT);
    let json = serde_json::to_value(&report).unwrap();
    assert!(json["parameters"]["mood"].is_string());
}

#[test]
fn empty_wav_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("empty.wav");
    audio::write_wav(&input_path, &[], SR).unwrap();
    let session = Session::dsp_only(&AppConfig::default()).unwrap();
    let err = session
        .generate(&input_path, &dir.path().join("out.wav"), None)
        .unwrap_err();
    assert!(matches!(err, LofiError::Input { .. }), "{err}");
}

#[test]
fn dsp_session_accepts_very_low_sample_rates() {
    let session = Session::dsp_only(&AppConfig::default()).unwrap();
    let input: Vec<f32> = (0..400).map(|i| (i as f32 * 0.4).sin() * 0.6).collect();
    let params = EffectParameters::new(80.0, 80.0, 80.0, Mood::Sleep);
    for sample_rate in [8, 40] {
        let output = session.transform(&input, sample_rate, Some(params)).unwrap();
        assert_eq!(output.len(), input.len());
        assert!(audio::peak(&output) <= 1.0);
    }
}
