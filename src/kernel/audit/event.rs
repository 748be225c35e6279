use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuditLevel;

/// One diagnosable thing that happened during a call.
///
/// Only `Transcript`, `TranscriptRejected`, `ReplyPlayed` and
/// `ReplyInterrupted` carry caller or assistant text; [`AuditEvent::redacted`]
/// replaces it with its length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStarted {
        session: Uuid,
        direction: String,
    },
    SessionEnded {
        reason: String,
    },
    Greeting,

    // capture path
    SourceCalibrated {
        endpoint: String,
        rms: f64,
    },
    CalibrationFailed {
        best_rms: f64,
    },
    SourcePinned {
        endpoint: String,
    },
    SourceUnpinned {
        reason: String,
    },
    SourceRotated {
        endpoint: String,
    },
    CaptureFailure {
        endpoint: String,
        streak: u32,
    },
    StreamRestarted {
        endpoint: String,
    },
    SegmentationAborted {
        reason: String,
    },
    UtteranceEmitted {
        chunks: u32,
        duration_ms: u64,
        end_reason: String,
    },
    FallbackCapture {
        attempt: u32,
        duration_ms: u32,
    },
    CaptureRejected {
        reason: String,
    },
    Continuation {
        windows: u32,
        merged_ms: u64,
    },
    StartupRecoveryComplete,

    // transcript path
    Transcript {
        text: String,
    },
    TranscriptRejected {
        reason: String,
        text: String,
    },
    ServerAsr,
    Clarification {
        reason: String,
    },

    // backend
    BackendError {
        #[serde(rename = "error_kind")]
        kind: String,
        detail: String,
    },
    EmptyReply,
    ReplySuppressed,

    // playback
    PlaybackStarted {
        target: String,
        sample_rate: u32,
        channels: u16,
        duration_ms: u64,
    },
    PlaybackDeviceFailed {
        target: String,
        detail: String,
    },
    PlaybackTimeout {
        target: String,
        treated_as_played: bool,
    },
    PlaybackForcedStop {
        target: String,
    },
    PlaybackFailed,
    ReplyPlayed {
        text: String,
    },
    ReplyInterrupted {
        text: String,
    },
    BargeIn {
        mode: String,
        rms: f64,
    },
    Prearm {
        attempt: u32,
        captured_ms: u64,
    },
    ReadyCue,

    // recovery and lifecycle
    RouteRecovery {
        ok: bool,
    },
    SilenceHangup {
        idle_ms: u64,
    },
    HangupFailed {
        detail: String,
    },
    TaskRejected {
        name: String,
    },
}

impl AuditEvent {
    /// Minimum trail level at which the event is kept.
    pub fn level(&self) -> AuditLevel {
        match self {
            Self::SessionStarted { .. }
            | Self::SessionEnded { .. }
            | Self::CalibrationFailed { .. }
            | Self::BackendError { .. }
            | Self::PlaybackDeviceFailed { .. }
            | Self::PlaybackTimeout { .. }
            | Self::PlaybackFailed
            | Self::RouteRecovery { .. }
            | Self::SilenceHangup { .. }
            | Self::HangupFailed { .. }
            | Self::TaskRejected { .. } => AuditLevel::Basic,
            Self::CaptureFailure { .. }
            | Self::StreamRestarted { .. }
            | Self::SegmentationAborted { .. }
            | Self::Prearm { .. }
            | Self::ReadyCue => AuditLevel::Verbose,
            _ => AuditLevel::Normal,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::Greeting => "greeting",
            Self::SourceCalibrated { .. } => "source_calibrated",
            Self::CalibrationFailed { .. } => "calibration_failed",
            Self::SourcePinned { .. } => "source_pinned",
            Self::SourceUnpinned { .. } => "source_unpinned",
            Self::SourceRotated { .. } => "source_rotated",
            Self::CaptureFailure { .. } => "capture_failure",
            Self::StreamRestarted { .. } => "stream_restarted",
            Self::SegmentationAborted { .. } => "segmentation_aborted",
            Self::UtteranceEmitted { .. } => "utterance_emitted",
            Self::FallbackCapture { .. } => "fallback_capture",
            Self::CaptureRejected { .. } => "capture_rejected",
            Self::Continuation { .. } => "continuation",
            Self::StartupRecoveryComplete => "startup_recovery_complete",
            Self::Transcript { .. } => "transcript",
            Self::TranscriptRejected { .. } => "transcript_rejected",
            Self::ServerAsr => "server_asr",
            Self::Clarification { .. } => "clarification",
            Self::BackendError { .. } => "backend_error",
            Self::EmptyReply => "empty_reply",
            Self::ReplySuppressed => "reply_suppressed",
            Self::PlaybackStarted { .. } => "playback_started",
            Self::PlaybackDeviceFailed { .. } => "playback_device_failed",
            Self::PlaybackTimeout { .. } => "playback_timeout",
            Self::PlaybackForcedStop { .. } => "playback_forced_stop",
            Self::PlaybackFailed => "playback_failed",
            Self::ReplyPlayed { .. } => "reply_played",
            Self::ReplyInterrupted { .. } => "reply_interrupted",
            Self::BargeIn { .. } => "barge_in",
            Self::Prearm { .. } => "prearm",
            Self::ReadyCue => "ready_cue",
            Self::RouteRecovery { .. } => "route_recovery",
            Self::SilenceHangup { .. } => "silence_hangup",
            Self::HangupFailed { .. } => "hangup_failed",
            Self::TaskRejected { .. } => "task_rejected",
        }
    }

    pub fn redacted(self) -> Self {
        let mask = |text: &str| format!("<{} chars>", text.chars().count());
        match self {
            Self::Transcript { text } => Self::Transcript { text: mask(&text) },
            Self::TranscriptRejected { reason, text } => Self::TranscriptRejected {
                reason,
                text: mask(&text),
            },
            Self::ReplyPlayed { text } => Self::ReplyPlayed { text: mask(&text) },
            Self::ReplyInterrupted { text } => Self::ReplyInterrupted { text: mask(&text) },
            other => other,
        }
    }
}
