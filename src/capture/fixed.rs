//! Fixed-duration capture, used when streaming segmentation produced nothing.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::prebuffer::RollingPrebuffer;
use super::selector::{FailureContext, FailureResponse, SourceSelectionState, SourceSelector};
use crate::audio::analysis::{self, CaptureAnalysis, QualityRejection, SpeakerCheck, SpeakerProfile};
use crate::config::AnalysisPolicy;
use crate::devices::CaptureProvider;
use crate::kernel::audit::{AuditEvent, AuditTrail};
use crate::kernel::time::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    pub endpoint_id: String,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub analysis: CaptureAnalysis,
}

impl CapturedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1_000 / self.sample_rate as u64
    }
}

#[derive(Debug)]
pub enum FixedAttempt {
    Captured(CapturedAudio),
    NoAudio {
        endpoint_id: Option<String>,
        response: FailureResponse,
    },
    Rejected {
        endpoint_id: String,
        reason: QualityRejection,
        analysis: CaptureAnalysis,
    },
}

/// Runs the quality checks, then the speaker check, then enrollment.
pub fn screen_capture(
    samples: &[i16],
    sample_rate: u32,
    policy: &AnalysisPolicy,
    speaker: &Mutex<SpeakerProfile>,
) -> Result<CaptureAnalysis, (QualityRejection, CaptureAnalysis)> {
    let analysis = analysis::analyze(samples, sample_rate, policy);
    if let Some(reason) = analysis::evaluate_quality(&analysis, policy) {
        return Err((reason, analysis));
    }
    check_speaker(&analysis, speaker).map_err(|reason| (reason, analysis))?;
    Ok(analysis)
}

/// Speaker consistency alone, for audio that already passed its own checks.
pub fn check_speaker(analysis: &CaptureAnalysis, speaker: &Mutex<SpeakerProfile>) -> Result<(), QualityRejection> {
    let mut profile = speaker.lock();
    match profile.verify(analysis) {
        SpeakerCheck::Mismatch(similarity) => {
            debug!(similarity, "speaker mismatch");
            Err(QualityRejection::SpeakerMismatch)
        }
        SpeakerCheck::NotEnrolled => {
            if profile.observe(analysis) {
                info!(voiced_ms = analysis.voiced_ms, "speaker enrolled");
            }
            Ok(())
        }
        SpeakerCheck::Disabled | SpeakerCheck::Match(_) => Ok(()),
    }
}

/// One blocking fixed-duration read from the selected source.
#[derive(Clone)]
pub struct FixedCapture {
    pub policy: AnalysisPolicy,
    /// Cap on the pre-buffer plus the new read; older samples are dropped first.
    pub max_merged_ms: u32,
    pub capture: Arc<dyn CaptureProvider>,
    pub selector: Arc<SourceSelector>,
    pub selection: Arc<Mutex<SourceSelectionState>>,
    pub prebuffer: Arc<RollingPrebuffer>,
    pub speaker: Arc<Mutex<SpeakerProfile>>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<dyn Clock>,
}

impl FixedCapture {
    pub fn capture(&self, duration_ms: u32, fast_endpoint: bool) -> FixedAttempt {
        let (endpoint_id, formats) = {
            let selection = self.selection.lock();
            (
                self.selector.endpoint(&selection).map(|e| e.id.clone()),
                self.selector.capture_formats(&selection),
            )
        };
        let Some(endpoint_id) = endpoint_id else {
            return FixedAttempt::NoAudio {
                endpoint_id: None,
                response: FailureResponse::default(),
            };
        };

        let mut frame = None;
        for format in formats {
            match self
                .capture
                .read_chunk(&endpoint_id, duration_ms, format.sample_rate, format.channels)
            {
                Ok(Some(f)) if !f.is_empty() => {
                    let mut selection = self.selection.lock();
                    self.selector.record_format(&mut selection, format);
                    self.selector.record_success(&mut selection);
                    frame = Some(f);
                    break;
                }
                Ok(_) => {}
                Err(e) => debug!(endpoint = %endpoint_id, error = %e, "fixed capture read failed"),
            }
        }

        let Some(frame) = frame else {
            let response = {
                let mut selection = self.selection.lock();
                self.selector.record_failure(
                    &mut selection,
                    FailureContext {
                        now_ms: self.clock.now_ms(),
                        speaking: false,
                        fast_endpoint,
                    },
                )
            };
            self.audit.record(AuditEvent::CaptureFailure {
                endpoint: endpoint_id.clone(),
                streak: response.failures,
            });
            if response.restart_stream {
                self.capture.restart_stream(&endpoint_id);
            }
            return FixedAttempt::NoAudio {
                endpoint_id: Some(endpoint_id),
                response,
            };
        };

        let sample_rate = frame.sample_rate;
        let mut samples = self.prebuffer.take(sample_rate);
        samples.extend_from_slice(&frame.samples);
        let cap = (sample_rate as u64 * self.max_merged_ms as u64 / 1_000) as usize;
        if samples.len() > cap {
            samples.drain(..samples.len() - cap);
        }

        match screen_capture(&samples, sample_rate, &self.policy, &self.speaker) {
            Ok(analysis) => FixedAttempt::Captured(CapturedAudio {
                endpoint_id,
                samples,
                sample_rate,
                analysis,
            }),
            Err((reason, analysis)) => {
                debug!(endpoint = %endpoint_id, reason = %reason, rms = analysis.overall_rms, "fixed capture rejected");
                self.audit.record(AuditEvent::CaptureRejected {
                    reason: reason.as_str().to_string(),
                });
                FixedAttempt::Rejected {
                    endpoint_id,
                    reason,
                    analysis,
                }
            }
        }
    }
}
