use std::io::Write;

use parley::config::{ConfigError, EngineConfig, SegmenterPolicy, TurnPolicy};
use parley::kernel::audit::AuditLevel;
use tempfile::NamedTempFile;

fn write_yaml(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write yaml");
    file
}

#[test]
fn test_defaults_are_valid() {
    let config = EngineConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.capture_endpoints.len(), 4);
    assert_eq!(config.playback_targets[0].speed_compensation, 1.5);
    assert!(config.policy.fallback.strict_stream_only);
    assert_eq!(config.policy.fallback.max_merged_capture_ms, 5_200);
    assert!(!config.policy.speaker.verification_enabled);
}

#[test]
fn test_partial_yaml_overrides_only_what_it_names() {
    // 1. A file touching four sections
    let file = write_yaml(
        r#"
policy:
  segmenter:
    silence_ms: 640
  reply:
    clarification_enabled: true
  fallback:
    max_merged_capture_ms: 3000
backend:
  base_url: "http://10.0.0.2:9000"
audit:
  level: verbose
capture_endpoints:
  - id: "7"
    display_name: "usb mic"
    sample_rates: [16000]
"#,
    );

    // 2. Load it
    let config = EngineConfig::load(file.path()).expect("config loads");

    // 3. Named fields changed, everything else kept its default
    assert_eq!(config.policy.segmenter.silence_ms, 640);
    assert_eq!(config.policy.segmenter.chunk_ms, 120);
    assert!(config.policy.reply.clarification_enabled);
    assert_eq!(config.policy.reply.max_sentences, 3);
    assert_eq!(config.policy.fallback.max_merged_capture_ms, 3_000);
    assert_eq!(config.policy.fallback.capture_duration_by_attempt_ms, vec![1_800, 2_200, 2_600]);
    assert_eq!(config.backend.base_url, "http://10.0.0.2:9000");
    assert_eq!(config.backend.turn_path, "/api/turn");
    assert_eq!(config.audit.level, AuditLevel::Verbose);
    assert_eq!(config.capture_endpoints.len(), 1);
    assert_eq!(config.capture_endpoints[0].sample_rates, vec![16_000]);
    assert!(config.capture_endpoints[0].channel_counts.is_empty());
    assert_eq!(config.playback_targets.len(), 4, "targets untouched");
}

#[test]
fn test_missing_file_is_reported() {
    let err = EngineConfig::load("/definitely/not/here.yaml").expect_err("must fail");
    assert!(matches!(err, ConfigError::Missing(_)));
}

#[test]
fn test_malformed_yaml_is_a_parse_error() {
    let file = write_yaml("policy: [this is not a map");
    let err = EngineConfig::load(file.path()).expect_err("must fail");
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_validation_catches_bad_values() {
    let invalid_field = |config: &EngineConfig| match config.validate() {
        Err(ConfigError::Invalid { field, .. }) => field,
        other => panic!("expected invalid config, got {other:?}"),
    };

    // 1. No capture endpoints
    let mut config = EngineConfig::default();
    config.capture_endpoints.clear();
    assert_eq!(invalid_field(&config), "capture_endpoints");

    // 2. A ratio outside [0, 1]
    let mut config = EngineConfig::default();
    config.policy.gate.turn_echo_overlap = 1.4;
    assert_eq!(invalid_field(&config), "gate.turn_echo_overlap");

    // 3. A pattern that does not compile
    let mut config = EngineConfig::default();
    config.policy.gate.low_quality_patterns.push("(open".to_string());
    assert_eq!(invalid_field(&config), "gate.low_quality_patterns");

    // 4. A playback timeout range upside down
    let mut config = EngineConfig::default();
    config.policy.playback.min_timeout_ms = 100_000;
    assert_eq!(invalid_field(&config), "playback.min_timeout_ms");

    // 5. A target that never drains
    let mut config = EngineConfig::default();
    config.playback_targets[1].speed_compensation = 0.0;
    assert_eq!(invalid_field(&config), "playback_targets");

    // 6. A fixed capture that may keep no audio at all
    let mut config = EngineConfig::default();
    config.policy.fallback.max_merged_capture_ms = 0;
    assert_eq!(invalid_field(&config), "fallback.max_merged_capture_ms");
}

#[test]
fn test_invalid_file_is_rejected_on_load() {
    let file = write_yaml("policy:\n  segmenter:\n    chunk_ms: 0\n");
    let err = EngineConfig::load(file.path()).expect_err("must fail");
    assert!(matches!(err, ConfigError::Invalid { field: "segmenter.chunk_ms", .. }));
}

#[test]
fn test_stream_simulation_preset() {
    let policy = TurnPolicy::stream_simulation();
    assert!(policy.validate().is_ok());
    assert_eq!(
        policy.segmenter,
        SegmenterPolicy {
            chunk_ms: 260,
            pre_roll_ms: 640,
            rolling_prebuffer_ms: 640,
            min_speech_ms: 260,
            silence_ms: 760,
            max_turn_ms: 14_000,
            loop_timeout_ms: 18_000,
            no_speech_timeout_ms: 18_000,
            vad_rms: 120.0,
            use_webrtc_vad: false,
            ..SegmenterPolicy::default()
        }
    );
    assert_eq!(policy.gate, TurnPolicy::default().gate, "only segmentation differs");
}
