//! Detects the caller talking over the assistant.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audio::analysis::{self, CaptureAnalysis};
use crate::audio::wav;
use crate::capture::selector::{SourceSelectionState, SourceSelector};
use crate::config::{AnalysisPolicy, BargeInPolicy};
use crate::devices::CaptureProvider;
use crate::gate::text;
use crate::services::dialogue::Transcriber;

#[derive(Debug, Clone, PartialEq)]
pub enum BargeInVerdict {
    /// Nothing usable was captured.
    NoAudio,
    /// Below the minimum energy or voicing.
    Quiet { rms: f64 },
    Energy { rms: f64 },
    Strong { rms: f64 },
    Speech { overlap: f64 },
    /// Speech, but it is the assistant's own reply coming back.
    Echo { overlap: f64 },
    /// Loud enough, but no confirming transcript.
    Unconfirmed,
}

impl BargeInVerdict {
    pub fn interrupts(&self) -> bool {
        matches!(self, Self::Energy { .. } | Self::Strong { .. } | Self::Speech { .. })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Energy { .. } => "energy",
            Self::Strong { .. } => "strong",
            Self::Speech { .. } => "speech",
            _ => "none",
        }
    }
}

/// What the energy of a probe clip says on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum EnergyDecision {
    Decided(BargeInVerdict),
    NeedsTranscript,
}

pub fn classify_energy(analysis: &CaptureAnalysis, policy: &BargeInPolicy) -> EnergyDecision {
    let rms = analysis.overall_rms;
    if rms < policy.min_rms || analysis.voiced_ms < policy.min_voiced_ms {
        return EnergyDecision::Decided(BargeInVerdict::Quiet { rms });
    }
    if policy.energy_only {
        if rms >= policy.energy_only_min_rms && analysis.voiced_ms >= policy.energy_only_min_voiced_ms {
            return EnergyDecision::Decided(BargeInVerdict::Energy { rms });
        }
        return EnergyDecision::Decided(BargeInVerdict::Quiet { rms });
    }
    if rms >= policy.strong_rms && analysis.voiced_ms >= policy.strong_voiced_ms {
        return EnergyDecision::Decided(BargeInVerdict::Strong { rms });
    }
    EnergyDecision::NeedsTranscript
}

/// Judges a probe transcript against the reply being played.
pub fn classify_transcript(transcript: &str, echo_reference: &str, policy: &BargeInPolicy) -> BargeInVerdict {
    if text::alnum_count(transcript) < policy.min_alnum_chars {
        return BargeInVerdict::Unconfirmed;
    }
    let overlap = text::token_overlap(transcript, echo_reference);
    if overlap < policy.echo_overlap {
        BargeInVerdict::Speech { overlap }
    } else {
        BargeInVerdict::Echo { overlap }
    }
}

pub struct BargeInProbe {
    pub policy: BargeInPolicy,
    pub analysis: AnalysisPolicy,
    pub capture: Arc<dyn CaptureProvider>,
    pub selector: Arc<SourceSelector>,
    pub selection: Arc<Mutex<SourceSelectionState>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
}

impl BargeInProbe {
    pub fn enabled(&self) -> bool {
        self.policy.enabled
    }

    /// Captures one short clip and decides whether the caller is talking.
    pub async fn probe(&self, echo_reference: &str) -> BargeInVerdict {
        let (endpoint_id, format) = {
            let selection = self.selection.lock();
            let Some(endpoint) = self.selector.endpoint(&selection) else {
                return BargeInVerdict::NoAudio;
            };
            let formats = self.selector.capture_formats(&selection);
            let Some(format) = formats.first().copied() else {
                return BargeInVerdict::NoAudio;
            };
            (endpoint.id.clone(), format)
        };

        let capture = Arc::clone(&self.capture);
        let duration_ms = self.policy.probe_capture_ms;
        let read = tokio::task::spawn_blocking(move || {
            capture.read_chunk(&endpoint_id, duration_ms, format.sample_rate, format.channels)
        })
        .await;
        let frame = match read {
            Ok(Ok(Some(frame))) if !frame.is_empty() => frame,
            Ok(Ok(_)) => return BargeInVerdict::NoAudio,
            Ok(Err(e)) => {
                debug!(error = %e, "barge-in probe read failed");
                return BargeInVerdict::NoAudio;
            }
            Err(e) => {
                debug!(error = %e, "barge-in probe task failed");
                return BargeInVerdict::NoAudio;
            }
        };

        let analysis = analysis::analyze(&frame.samples, frame.sample_rate, &self.analysis);
        let verdict = match classify_energy(&analysis, &self.policy) {
            EnergyDecision::Decided(verdict) => verdict,
            EnergyDecision::NeedsTranscript => {
                let Some(transcriber) = &self.transcriber else {
                    return BargeInVerdict::Unconfirmed;
                };
                let clip = match wav::encode_mono(&frame.samples, frame.sample_rate) {
                    Ok(clip) => clip,
                    Err(e) => {
                        debug!(error = %e, "barge-in clip encode failed");
                        return BargeInVerdict::Unconfirmed;
                    }
                };
                match transcriber.transcribe(clip).await {
                    Ok(transcript) => classify_transcript(&transcript, echo_reference, &self.policy),
                    Err(e) => {
                        debug!(error = %e, "barge-in transcription failed");
                        BargeInVerdict::Unconfirmed
                    }
                }
            }
        };
        if verdict.interrupts() {
            info!(mode = verdict.mode(), rms = analysis.overall_rms, "barge-in detected");
        }
        verdict
    }
}
