use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Every threshold the turn engine consults, grouped by the stage that reads it.
///
/// `TurnPolicy::default()` carries the live-call constants. `stream_simulation()`
/// carries the constants the offline simulator was tuned with. Neither is special:
/// a YAML file can override any field of either.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnPolicy {
    pub segmenter: SegmenterPolicy,
    pub analysis: AnalysisPolicy,
    pub speaker: SpeakerPolicy,
    pub selector: SelectorPolicy,
    pub fallback: FallbackPolicy,
    pub continuation: ContinuationPolicy,
    pub gate: GatePolicy,
    pub reply: ReplyPolicy,
    pub retry: RetryPolicy,
    pub playback: PlaybackPolicy,
    pub barge_in: BargeInPolicy,
    pub ready_cue: ReadyCuePolicy,
    pub watchdog: WatchdogPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterPolicy {
    pub chunk_ms: u32,
    pub pre_roll_ms: u32,
    pub rolling_prebuffer_ms: u32,
    pub min_speech_ms: u32,
    pub silence_ms: u32,
    pub fast_post_playback_silence_ms: u32,
    pub fast_post_playback_window_ms: u64,
    pub max_turn_ms: u32,
    pub loop_timeout_ms: u32,
    pub no_speech_timeout_ms: u32,
    /// Chunk RMS that counts as voiced when the WebRTC detector is off.
    pub vad_rms: f64,
    pub use_webrtc_vad: bool,
    /// With the WebRTC detector on, a chunk this loud is voiced regardless of its verdict.
    pub vad_rms_fallback: f64,
    pub vad_min_speech_frame_ratio: f64,
}

impl Default for SegmenterPolicy {
    fn default() -> Self {
        Self {
            chunk_ms: 120,
            pre_roll_ms: 1_200,
            rolling_prebuffer_ms: 1_200,
            min_speech_ms: 100,
            silence_ms: 520,
            fast_post_playback_silence_ms: 220,
            fast_post_playback_window_ms: 3_000,
            max_turn_ms: 8_000,
            loop_timeout_ms: 20_000,
            no_speech_timeout_ms: 700,
            vad_rms: 80.0,
            use_webrtc_vad: true,
            vad_rms_fallback: 120.0,
            vad_min_speech_frame_ratio: 0.35,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisPolicy {
    pub frame_ms: u32,
    pub min_vad_rms: f64,
    pub vad_noise_multiplier: f64,
    pub clip_threshold: i16,
    pub min_capture_rms: f64,
    pub min_voiced_ms: u32,
    pub min_voiced_ratio: f64,
    pub min_dynamic_range: f64,
    pub max_clipping_ratio: f64,
    pub min_capture_confidence: f64,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            min_vad_rms: 30.0,
            vad_noise_multiplier: 1.45,
            clip_threshold: 32_760,
            min_capture_rms: 24.0,
            min_voiced_ms: 420,
            min_voiced_ratio: 0.14,
            min_dynamic_range: 4.5,
            max_clipping_ratio: 0.03,
            min_capture_confidence: 0.36,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerPolicy {
    pub verification_enabled: bool,
    pub min_enroll_voiced_ms: u32,
    pub min_similarity: f64,
}

impl Default for SpeakerPolicy {
    fn default() -> Self {
        Self {
            verification_enabled: false,
            min_enroll_voiced_ms: 950,
            min_similarity: 0.52,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorPolicy {
    pub request_sample_rate: u32,
    pub sample_rate_candidates: Vec<u32>,
    pub primary_channels: u16,
    pub channel_candidates: Vec<u16>,
    pub probe_capture_ms: u32,
    pub calibration_min_rms: f64,
    pub calibration_throttle_ms: u64,
    pub no_audio_unpin_threshold: u32,
    pub source_rotate_threshold: u32,
    pub stream_restart_threshold: u32,
    pub startup_recovery_enabled: bool,
    pub startup_recovery_window_ms: u64,
    pub startup_no_audio_unpin_threshold: u32,
    pub startup_rotate_threshold: u32,
    pub fast_post_playback_rebind_threshold: u32,
    pub fast_post_playback_unpin_threshold: u32,
    pub startup_fast_post_playback_unpin_threshold: u32,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        Self {
            request_sample_rate: 48_000,
            sample_rate_candidates: vec![48_000, 16_000],
            primary_channels: 2,
            channel_candidates: vec![2, 1],
            probe_capture_ms: 480,
            calibration_min_rms: 10.0,
            calibration_throttle_ms: 1_600,
            no_audio_unpin_threshold: 20,
            source_rotate_threshold: 20,
            stream_restart_threshold: 2,
            startup_recovery_enabled: true,
            startup_recovery_window_ms: 30_000,
            startup_no_audio_unpin_threshold: 4,
            startup_rotate_threshold: 4,
            fast_post_playback_rebind_threshold: 2,
            fast_post_playback_unpin_threshold: 20,
            startup_fast_post_playback_unpin_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// When set, a turn that the segmenter could not fill is simply retried.
    pub strict_stream_only: bool,
    pub capture_duration_by_attempt_ms: Vec<u32>,
    pub max_same_source_retries: u32,
    /// Longest audio a fixed capture hands on once the carried pre-buffer is prepended.
    pub max_merged_capture_ms: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            strict_stream_only: true,
            capture_duration_by_attempt_ms: vec![1_800, 2_200, 2_600],
            max_same_source_retries: 1,
            max_merged_capture_ms: 5_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationPolicy {
    pub enabled: bool,
    pub capture_ms: u32,
    pub max_windows: u32,
    pub end_boundary_windows: u32,
    pub max_chunks: u32,
    pub max_merged_audio_ms: u32,
    pub terminal_min_tokens: usize,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_ms: 700,
            max_windows: 3,
            end_boundary_windows: 1,
            max_chunks: 4,
            max_merged_audio_ms: 9_500,
            terminal_min_tokens: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    pub min_alnum_chars: usize,
    pub low_quality_patterns: Vec<String>,
    pub repeated_char_run: usize,
    pub diversity_min_alnum: usize,
    pub min_char_diversity: f64,
    pub repetitive_min_tokens: usize,
    pub min_token_diversity: f64,
    pub short_turn_max_tokens: usize,
    pub short_turn_consensus_overlap: f64,
    pub turn_echo_window_ms: u64,
    pub turn_echo_overlap: f64,
    pub post_playback_echo_window_ms: u64,
    pub post_playback_echo_max_tokens: usize,
    pub post_playback_echo_overlap: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_alnum_chars: 2,
            low_quality_patterns: vec![
                r"^(no\s+){6,}no$".to_string(),
                r"^([.\-]\s*){8,}$".to_string(),
                r"^(z\s*){6,}$".to_string(),
            ],
            repeated_char_run: 8,
            diversity_min_alnum: 24,
            min_char_diversity: 0.18,
            repetitive_min_tokens: 7,
            min_token_diversity: 0.30,
            short_turn_max_tokens: 2,
            short_turn_consensus_overlap: 0.45,
            turn_echo_window_ms: 8_000,
            turn_echo_overlap: 0.70,
            post_playback_echo_window_ms: 1_200,
            post_playback_echo_max_tokens: 3,
            post_playback_echo_overlap: 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyPolicy {
    pub max_sentences: usize,
    pub max_chars: usize,
    pub dedupe_overlap: f64,
    pub suppress_backend_clarify: bool,
    pub clarification_enabled: bool,
    pub clarification_cooldown_ms: u64,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            max_sentences: 3,
            max_chars: 420,
            dedupe_overlap: 0.85,
            suppress_backend_clarify: true,
            clarification_enabled: false,
            clarification_cooldown_ms: 2_800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub capture_retry_ms: u64,
    pub transcript_retry_ms: u64,
    pub no_audio_retry_ms: u64,
    pub echo_retry_ms: u64,
    pub barge_in_resume_ms: u64,
    pub post_playback_capture_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            capture_retry_ms: 120,
            transcript_retry_ms: 260,
            no_audio_retry_ms: 450,
            echo_retry_ms: 120,
            barge_in_resume_ms: 40,
            post_playback_capture_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackPolicy {
    pub timeout_margin_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub poll_ms: u64,
    pub stuck_grace_ms: u64,
    pub timeout_assume_played: bool,
    pub min_estimated_duration_ms: u64,
    pub prearm_enabled: bool,
    /// Pre-arming starts this long before the expected end of playback.
    pub prearm_window_ms: u64,
    pub prearm_min_start_after_ms: u64,
    pub prearm_retry_ms: u64,
    pub prearm_max_attempts: u32,
    pub prearm_chunk_ms: u32,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            timeout_margin_ms: 2_500,
            min_timeout_ms: 1_200,
            max_timeout_ms: 90_000,
            poll_ms: 60,
            stuck_grace_ms: 350,
            timeout_assume_played: true,
            min_estimated_duration_ms: 300,
            prearm_enabled: true,
            prearm_window_ms: 900,
            prearm_min_start_after_ms: 300,
            prearm_retry_ms: 180,
            prearm_max_attempts: 4,
            prearm_chunk_ms: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInPolicy {
    pub enabled: bool,
    pub arm_delay_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_capture_ms: u32,
    pub min_rms: f64,
    pub min_voiced_ms: u32,
    pub strong_rms: f64,
    pub strong_voiced_ms: u32,
    /// Accept energy alone without transcribing the probe.
    pub energy_only: bool,
    pub energy_only_min_rms: f64,
    pub energy_only_min_voiced_ms: u32,
    pub min_alnum_chars: usize,
    pub echo_overlap: f64,
}

impl Default for BargeInPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            arm_delay_ms: 80,
            probe_interval_ms: 220,
            probe_capture_ms: 220,
            min_rms: 20.0,
            min_voiced_ms: 60,
            strong_rms: 28.0,
            strong_voiced_ms: 100,
            energy_only: false,
            energy_only_min_rms: 24.0,
            energy_only_min_voiced_ms: 80,
            min_alnum_chars: 2,
            echo_overlap: 0.68,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadyCuePolicy {
    pub enabled: bool,
    pub duration_ms: u32,
    pub frequency_hz: f64,
    pub amplitude: f64,
    pub attack_ms: u32,
    pub release_ms: u32,
    pub min_interval_ms: u64,
    /// Extra wait before capture resumes after the cue was played.
    pub followup_delay_ms: u64,
    pub sample_rate: u32,
}

impl Default for ReadyCuePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_ms: 95,
            frequency_hz: 1_320.0,
            amplitude: 0.18,
            attack_ms: 10,
            release_ms: 20,
            min_interval_ms: 320,
            followup_delay_ms: 60,
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogPolicy {
    pub silence_hangup_ms: u64,
    pub check_interval_ms: u64,
    pub route_recover_throttle_ms: u64,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            silence_hangup_ms: 90_000,
            check_interval_ms: 1_000,
            route_recover_throttle_ms: 1_800,
        }
    }
}

impl TurnPolicy {
    /// Constants the offline stream simulator runs with: longer chunks, a shorter
    /// pre-roll, a stricter energy gate and no WebRTC refinement.
    pub fn stream_simulation() -> Self {
        Self {
            segmenter: SegmenterPolicy {
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
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segmenter;
        if seg.chunk_ms == 0 {
            return Err(ConfigError::invalid("segmenter.chunk_ms", "must be positive"));
        }
        if seg.max_turn_ms < seg.min_speech_ms {
            return Err(ConfigError::invalid(
                "segmenter.max_turn_ms",
                format!("{} is below min_speech_ms {}", seg.max_turn_ms, seg.min_speech_ms),
            ));
        }
        if seg.loop_timeout_ms == 0 {
            return Err(ConfigError::invalid("segmenter.loop_timeout_ms", "must be positive"));
        }
        check_ratio("segmenter.vad_min_speech_frame_ratio", seg.vad_min_speech_frame_ratio)?;
        if self.analysis.frame_ms == 0 {
            return Err(ConfigError::invalid("analysis.frame_ms", "must be positive"));
        }
        check_ratio("analysis.min_voiced_ratio", self.analysis.min_voiced_ratio)?;
        check_ratio("analysis.max_clipping_ratio", self.analysis.max_clipping_ratio)?;
        check_ratio("speaker.min_similarity", self.speaker.min_similarity)?;
        if self.selector.request_sample_rate == 0 {
            return Err(ConfigError::invalid("selector.request_sample_rate", "must be positive"));
        }
        if self.fallback.capture_duration_by_attempt_ms.is_empty() {
            return Err(ConfigError::invalid(
                "fallback.capture_duration_by_attempt_ms",
                "needs at least one attempt",
            ));
        }
        if self.fallback.max_merged_capture_ms == 0 {
            return Err(ConfigError::invalid("fallback.max_merged_capture_ms", "must be positive"));
        }
        for (field, ratio) in [
            ("gate.short_turn_consensus_overlap", self.gate.short_turn_consensus_overlap),
            ("gate.turn_echo_overlap", self.gate.turn_echo_overlap),
            ("gate.post_playback_echo_overlap", self.gate.post_playback_echo_overlap),
            ("reply.dedupe_overlap", self.reply.dedupe_overlap),
            ("barge_in.echo_overlap", self.barge_in.echo_overlap),
        ] {
            check_ratio(field, ratio)?;
        }
        for pattern in &self.gate.low_quality_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("gate.low_quality_patterns", e.to_string()))?;
        }
        let pb = &self.playback;
        if pb.min_timeout_ms > pb.max_timeout_ms {
            return Err(ConfigError::invalid(
                "playback.min_timeout_ms",
                format!("{} exceeds max_timeout_ms {}", pb.min_timeout_ms, pb.max_timeout_ms),
            ));
        }
        if pb.poll_ms == 0 {
            return Err(ConfigError::invalid("playback.poll_ms", "must be positive"));
        }
        if self.watchdog.check_interval_ms == 0 {
            return Err(ConfigError::invalid("watchdog.check_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

fn check_ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} is outside [0, 1]")))
    }
}
