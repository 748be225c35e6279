use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use super::{AuditEvent, AuditRecord};

/// Per-call counters derived from the trail, logged when a call ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditSummary {
    pub utterances: u64,
    pub replies_played: u64,
    pub replies_interrupted: u64,
    pub backend_errors: u64,
    pub playback_timeouts: u64,
    pub capture_failures: u64,
    pub rejections: BTreeMap<String, u64>,
    pub avg_utterance_ms: f64,
}

pub fn compute_summary(records: &VecDeque<AuditRecord>) -> AuditSummary {
    let mut summary = AuditSummary::default();
    let mut utterance_ms = 0u64;
    for record in records {
        match &record.event {
            AuditEvent::UtteranceEmitted { duration_ms, .. } => {
                summary.utterances += 1;
                utterance_ms += duration_ms;
            }
            AuditEvent::ReplyPlayed { .. } => summary.replies_played += 1,
            AuditEvent::ReplyInterrupted { .. } => summary.replies_interrupted += 1,
            AuditEvent::BackendError { .. } => summary.backend_errors += 1,
            AuditEvent::PlaybackTimeout { .. } => summary.playback_timeouts += 1,
            AuditEvent::CaptureFailure { .. } => summary.capture_failures += 1,
            AuditEvent::CaptureRejected { reason } | AuditEvent::TranscriptRejected { reason, .. } => {
                *summary.rejections.entry(reason.clone()).or_default() += 1;
            }
            _ => {}
        }
    }
    if summary.utterances > 0 {
        summary.avg_utterance_ms = utterance_ms as f64 / summary.utterances as f64;
    }
    summary
}
