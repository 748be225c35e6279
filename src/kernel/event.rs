use serde::Serialize;

use crate::config::RetryPolicy;

/// How a turn ended. No error crosses the orchestrator boundary; everything
/// is folded into one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    Played,
    Interrupted,
    TimedOut,
    Failed(FailureKind),
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Played => "played",
            Self::Interrupted => "interrupted",
            Self::TimedOut => "timed_out",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Another turn is already in flight.
    Busy,
    CallEnded,
    /// Segmentation and every fallback attempt came back empty.
    NoUtterance { reason: String },
    /// The capture or transcript was rejected; `reason` is the structured rejection.
    Rejected { reason: String },
    Backend { kind: String },
    EmptyReply,
    /// The backend answered with its own "could not hear you" line.
    SuppressedReply,
    Playback,
}

impl FailureKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Busy => "busy",
            Self::CallEnded => "call_ended",
            Self::NoUtterance { reason } | Self::Rejected { reason } => reason,
            Self::Backend { kind } => kind,
            Self::EmptyReply => "empty_reply",
            Self::SuppressedReply => "suppressed_reply",
            Self::Playback => "playback",
        }
    }
}

/// Delay class before the next capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Capture,
    Transcript,
    NoAudio,
    Echo,
    BargeInResume,
    PostPlayback,
}

impl RetryClass {
    pub fn delay_ms(&self, policy: &RetryPolicy) -> u64 {
        match self {
            Self::Capture => policy.capture_retry_ms,
            Self::Transcript => policy.transcript_retry_ms,
            Self::NoAudio => policy.no_audio_retry_ms,
            Self::Echo => policy.echo_retry_ms,
            Self::BargeInResume => policy.barge_in_resume_ms,
            Self::PostPlayback => policy.post_playback_capture_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub retry: RetryClass,
    pub retry_after_ms: u64,
    pub transcript: Option<String>,
    pub reply: Option<String>,
}

impl TurnReport {
    pub fn rejection(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Failed(FailureKind::Rejected { reason }) => Some(reason),
            _ => None,
        }
    }
}
