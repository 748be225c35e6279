use std::fmt;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use super::text;
use crate::config::GatePolicy;
use crate::kernel::event::RetryClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRejection {
    EmptyNormalized,
    LowQualityPattern,
    ShortAlnum,
    RepetitiveChars,
    LowCharDiversity,
    RepetitiveTokens,
    ShortTurnUnconfirmed,
    PostPlaybackEcho,
    Echo,
}

impl GateRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyNormalized => "empty_normalized",
            Self::LowQualityPattern => "low_quality_pattern",
            Self::ShortAlnum => "short_alnum",
            Self::RepetitiveChars => "repetitive_chars",
            Self::LowCharDiversity => "low_char_diversity",
            Self::RepetitiveTokens => "repetitive_tokens",
            Self::ShortTurnUnconfirmed => "short_turn_unconfirmed",
            Self::PostPlaybackEcho => "post_playback_echo",
            Self::Echo => "echo",
        }
    }

    pub fn is_echo(&self) -> bool {
        matches!(self, Self::Echo | Self::PostPlaybackEcho)
    }

    /// Which retry delay the orchestrator should wait before listening again.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::EmptyNormalized => RetryClass::Capture,
            Self::Echo | Self::PostPlaybackEcho => RetryClass::Echo,
            _ => RetryClass::Transcript,
        }
    }
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the gate knows beyond the transcript itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateContext<'a> {
    /// Text of the last assistant reply that was played.
    pub last_reply: Option<&'a str>,
    /// Time since that reply finished playing.
    pub since_playback_ms: Option<u64>,
    /// A second, independent transcription of the same audio.
    pub corroboration: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept(String),
    Reject(GateRejection),
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    pub fn rejection(&self) -> Option<GateRejection> {
        match self {
            Self::Reject(reason) => Some(*reason),
            Self::Accept(_) => None,
        }
    }
}

/// Transcript quality and echo filter. Holds no per-call state: the decision
/// depends only on the transcript and the context passed in.
pub struct TranscriptGate {
    policy: GatePolicy,
    patterns: Vec<Regex>,
}

impl TranscriptGate {
    pub fn new(policy: GatePolicy) -> Self {
        let patterns = policy
            .low_quality_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "ignoring invalid low-quality pattern");
                    None
                }
            })
            .collect();
        Self { policy, patterns }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Short transcripts are only trusted when a second transcription agrees.
    pub fn needs_corroboration(&self, transcript: &str) -> bool {
        let count = text::tokens(transcript).len();
        count > 0 && count <= self.policy.short_turn_max_tokens
    }

    /// The content checks alone, in order, without consensus or echo.
    pub fn is_low_quality(&self, transcript: &str) -> Option<GateRejection> {
        let normalized = text::normalize(transcript);
        if normalized.is_empty() {
            return Some(GateRejection::EmptyNormalized);
        }
        if self.patterns.iter().any(|re| re.is_match(&normalized)) {
            return Some(GateRejection::LowQualityPattern);
        }
        let alnum = text::alnum_count(&normalized);
        if alnum < self.policy.min_alnum_chars {
            return Some(GateRejection::ShortAlnum);
        }
        if self.policy.repeated_char_run > 0 && text::longest_char_run(&normalized) >= self.policy.repeated_char_run {
            return Some(GateRejection::RepetitiveChars);
        }
        if alnum >= self.policy.diversity_min_alnum && text::char_diversity(&normalized) < self.policy.min_char_diversity {
            return Some(GateRejection::LowCharDiversity);
        }
        let tokens = text::tokens(&normalized);
        if tokens.len() >= self.policy.repetitive_min_tokens
            && text::token_diversity(&tokens) < self.policy.min_token_diversity
        {
            return Some(GateRejection::RepetitiveTokens);
        }
        None
    }

    pub fn evaluate(&self, transcript: &str, ctx: &GateContext<'_>) -> GateDecision {
        if let Some(reason) = self.is_low_quality(transcript) {
            return GateDecision::Reject(reason);
        }

        let token_count = text::tokens(transcript).len();
        if self.needs_corroboration(transcript) {
            let agreed = ctx
                .corroboration
                .map(|other| text::token_overlap(transcript, other) >= self.policy.short_turn_consensus_overlap)
                .unwrap_or(false);
            if !agreed {
                return GateDecision::Reject(GateRejection::ShortTurnUnconfirmed);
            }
        }

        if let (Some(reply), Some(since)) = (ctx.last_reply, ctx.since_playback_ms) {
            if !reply.trim().is_empty() {
                let overlap = text::token_overlap(transcript, reply);
                if since <= self.policy.post_playback_echo_window_ms
                    && token_count <= self.policy.post_playback_echo_max_tokens
                    && overlap >= self.policy.post_playback_echo_overlap
                {
                    return GateDecision::Reject(GateRejection::PostPlaybackEcho);
                }
                if since <= self.policy.turn_echo_window_ms && overlap >= self.policy.turn_echo_overlap {
                    return GateDecision::Reject(GateRejection::Echo);
                }
            }
        }

        GateDecision::Accept(transcript.trim().to_string())
    }
}
