//! The turn loop: listen, check, ask the backend, speak, repeat.
//!
//! At most one turn runs at a time per call. Every failure folds into a
//! [`TurnReport`] carrying the delay before the next attempt; nothing here
//! ends the call except the call itself or the silence watchdog.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditTrail};
use super::event::{FailureKind, RetryClass, TurnOutcome, TurnReport};
use super::session::{CallDirection, CallSession, SessionFlags, TurnGuard};
use super::tasks::TaskPool;
use super::time::Clock;
use super::watchdog::SilenceWatchdog;
use crate::audio::analysis::{self, QualityRejection, SpeakerProfile};
use crate::audio::{resample, tone, wav};
use crate::capture::fixed::{self, FixedAttempt, FixedCapture};
use crate::capture::segmenter::{AbortReason, SegmentOutcome, SegmentReport, SegmenterDriver};
use crate::capture::{RollingPrebuffer, SourceSelectionState, SourceSelector};
use crate::config::{ContinuationPolicy, EngineConfig};
use crate::devices::{CallStateProvider, CaptureProvider, PlaybackDevice, RouteController};
use crate::gate::{self, text, GateContext, GateDecision, TranscriptGate};
use crate::outputs::{BargeInProbe, PlaybackResult, PlaybackSupervisor, PrearmSource};
use crate::services::dialogue::{BackendError, DialogueBackend, Synthesizer, Transcriber, TurnReply, TurnRequest};

/// Fallback rejection reasons that move to the next source without a
/// same-source retry.
const ROTATE_IMMEDIATELY: &[&str] = &[
    "speaker_mismatch",
    "clipping",
    "flat_signal",
    "asr_empty",
    "low_quality_transcript",
    "low_dynamic",
    "low_confidence",
];

const NO_AUDIO_SOURCE: &str = "no_audio_source";
const ASR_EMPTY: &str = "asr_empty";
const LOW_QUALITY_TRANSCRIPT: &str = "low_quality_transcript";

/// Whether a fixed-capture transcript looks unfinished enough to keep listening.
pub fn should_collect_continuation(transcript: &str, policy: &ContinuationPolicy) -> bool {
    let trimmed = transcript.trim();
    if trimmed.is_empty() {
        return false;
    }
    if !trimmed.ends_with(['.', '!', '?']) {
        return true;
    }
    trimmed.split_whitespace().count() <= policy.terminal_min_tokens
}

pub fn should_retry_same_source(reason: &str, retries: u32, max_retries: u32) -> bool {
    !ROTATE_IMMEDIATELY.contains(&reason) && retries < max_retries
}

/// Short spoken prompt for a rejection reason.
pub fn clarification_prompt(reason: &str) -> &'static str {
    match reason {
        "speaker_mismatch" => "I am picking up another voice nearby. Please speak again clearly.",
        "low_rms" | "low_voiced_ratio" | "short_voice" => "I could not hear that clearly. Please repeat.",
        "flat_signal" | "clipping" | "low_confidence" => "The line was noisy. Please repeat slowly.",
        _ => "Please repeat that clearly.",
    }
}

/// The collaborators a call is driven through.
#[derive(Clone)]
pub struct Collaborators {
    pub call: Arc<dyn CallStateProvider>,
    pub capture: Arc<dyn CaptureProvider>,
    pub playback: Arc<dyn PlaybackDevice>,
    pub route: Arc<dyn RouteController>,
    pub backend: Arc<dyn DialogueBackend>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub clock: Arc<dyn Clock>,
}

/// Audio and text of a turn on its way to the backend.
struct Candidate {
    transcript: String,
    samples: Vec<i16>,
    sample_rate: u32,
    chunk_count: u32,
}

impl Candidate {
    fn wav(&self) -> Option<Vec<u8>> {
        match wav::encode_mono(&self.samples, self.sample_rate) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode turn audio");
                None
            }
        }
    }
}

pub struct TurnOrchestrator {
    config: EngineConfig,
    parts: Collaborators,
    session: Mutex<CallSession>,
    flags: Arc<SessionFlags>,
    selector: Arc<SourceSelector>,
    selection: Arc<Mutex<SourceSelectionState>>,
    prebuffer: Arc<RollingPrebuffer>,
    speaker: Arc<Mutex<SpeakerProfile>>,
    gate: TranscriptGate,
    supervisor: PlaybackSupervisor,
    barge_in: BargeInProbe,
    audit: Arc<AuditTrail>,
    tasks: TaskPool,
    last_route_recovery_ms: Mutex<Option<u64>>,
    last_clarification_ms: Mutex<Option<u64>>,
    last_cue_ms: Mutex<Option<u64>>,
}

impl TurnOrchestrator {
    pub fn new(config: EngineConfig, parts: Collaborators, direction: CallDirection) -> Self {
        let now = parts.clock.now_ms();
        let policy = &config.policy;
        let audit = Arc::new(AuditTrail::new(&config.audit));
        let selector = Arc::new(SourceSelector::new(config.capture_endpoints.clone(), policy.selector.clone()));
        let selection = Arc::new(Mutex::new(selector.start_session(now)));
        let prebuffer = Arc::new(RollingPrebuffer::new(policy.segmenter.rolling_prebuffer_ms));
        let session = CallSession::new(direction, now);

        let supervisor = PlaybackSupervisor::new(
            policy.playback.clone(),
            config.playback_targets.clone(),
            Arc::clone(&parts.playback),
            Arc::clone(&parts.call),
            Arc::clone(&audit),
        )
        .with_prearm(PrearmSource {
            capture: Arc::clone(&parts.capture),
            selector: Arc::clone(&selector),
            selection: Arc::clone(&selection),
            prebuffer: Arc::clone(&prebuffer),
        });
        let barge_in = BargeInProbe {
            policy: policy.barge_in.clone(),
            analysis: policy.analysis.clone(),
            capture: Arc::clone(&parts.capture),
            selector: Arc::clone(&selector),
            selection: Arc::clone(&selection),
            transcriber: parts.transcriber.clone(),
        };

        info!(session = %session.id, ?direction, "call session started");
        audit.record(AuditEvent::SessionStarted {
            session: session.id,
            direction: format!("{direction:?}").to_lowercase(),
        });

        Self {
            gate: TranscriptGate::new(policy.gate.clone()),
            speaker: Arc::new(Mutex::new(SpeakerProfile::new(policy.speaker.clone()))),
            flags: Arc::new(SessionFlags::new(now)),
            session: Mutex::new(session),
            selector,
            selection,
            prebuffer,
            supervisor,
            barge_in,
            audit,
            tasks: TaskPool::default(),
            last_route_recovery_ms: Mutex::new(None),
            last_clarification_ms: Mutex::new(None),
            last_cue_ms: Mutex::new(None),
            config,
            parts,
        }
    }

    pub fn session(&self) -> CallSession {
        self.session.lock().clone()
    }

    pub fn flags(&self) -> Arc<SessionFlags> {
        Arc::clone(&self.flags)
    }

    pub fn audit(&self) -> Arc<AuditTrail> {
        Arc::clone(&self.audit)
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn selection(&self) -> SourceSelectionState {
        self.selection.lock().clone()
    }

    fn now(&self) -> u64 {
        self.parts.clock.now_ms()
    }

    fn live(&self) -> bool {
        self.flags.is_active() && self.parts.call.is_call_active()
    }

    fn report(&self, outcome: TurnOutcome, retry: RetryClass) -> TurnReport {
        TurnReport {
            outcome,
            retry,
            retry_after_ms: retry.delay_ms(&self.config.policy.retry),
            transcript: None,
            reply: None,
        }
    }

    fn failed(&self, kind: FailureKind, retry: RetryClass) -> TurnReport {
        self.report(TurnOutcome::Failed(kind), retry)
    }

    /// Runs turns until the call ends, then tears the session down.
    pub async fn run(self: Arc<Self>) {
        let watchdog = Arc::new(SilenceWatchdog::new(
            self.config.policy.watchdog.clone(),
            Arc::clone(&self.flags),
            Arc::clone(&self.parts.call),
            Arc::clone(&self.parts.clock),
            Arc::clone(&self.audit),
        ));
        if !watchdog.spawn(&self.tasks) {
            self.audit.record(AuditEvent::TaskRejected {
                name: "silence_watchdog".to_string(),
            });
        }

        while self.live() {
            let report = self.run_turn().await;
            debug!(
                outcome = report.outcome.as_str(),
                retry = ?report.retry,
                delay_ms = report.retry_after_ms,
                "turn finished"
            );
            if report.retry_after_ms > 0 && self.live() {
                tokio::time::sleep(Duration::from_millis(report.retry_after_ms)).await;
            }
        }
        self.stop("call_ended").await;
    }

    /// Ends the session: in-flight loops see the flag and exit, background
    /// tasks are cancelled and awaited.
    pub async fn stop(&self, reason: &str) {
        if self.flags.deactivate() {
            info!(reason, summary = ?self.audit.summary(), "call session ended");
            self.audit.record(AuditEvent::SessionEnded {
                reason: reason.to_string(),
            });
            self.prebuffer.clear();
            self.speaker.lock().reset();
        }
        self.tasks.shutdown().await;
    }

    /// Opens the conversation with a fresh backend session and plays its
    /// greeting without listening for barge-in.
    pub async fn greet(&self) -> TurnReport {
        let Some(_guard) = TurnGuard::acquire(&self.flags) else {
            return self.failed(FailureKind::Busy, RetryClass::Capture);
        };
        if !self.live() {
            return self.failed(FailureKind::CallEnded, RetryClass::Capture);
        }
        self.audit.record(AuditEvent::Greeting);
        let request = TurnRequest {
            session_id: None,
            transcript_hint: None,
            skip_asr: true,
            reset_session: true,
            audio_wav: None,
        };
        let reply = match self.call_backend(request).await {
            Ok(reply) => reply,
            Err(e) => return self.backend_failed(e),
        };
        let text = gate::sanitize_reply(&reply.reply, &self.config.policy.reply);
        if text.is_empty() {
            self.audit.record(AuditEvent::EmptyReply);
            return self.failed(FailureKind::EmptyReply, RetryClass::Transcript);
        }
        let mut report = self.deliver(&text, reply.audio_wav.as_deref(), false).await;
        if report.outcome == TurnOutcome::Failed(FailureKind::Playback) {
            report.retry = RetryClass::NoAudio;
            report.retry_after_ms = RetryClass::NoAudio.delay_ms(&self.config.policy.retry);
        }
        report
    }

    /// One full cycle: capture, check, ask, speak.
    pub async fn run_turn(&self) -> TurnReport {
        let Some(_guard) = TurnGuard::acquire(&self.flags) else {
            return self.failed(FailureKind::Busy, RetryClass::Capture);
        };
        if !self.live() {
            return self.failed(FailureKind::CallEnded, RetryClass::Capture);
        }

        self.calibrate(false).await;
        let fast_endpoint = self
            .session
            .lock()
            .since_playback_ms(self.now())
            .is_some_and(|since| since <= self.config.policy.segmenter.fast_post_playback_window_ms);

        let segment = self.segment(fast_endpoint).await;
        if segment.route_recovery_requested {
            self.recover_route("capture_failures");
        }
        let mut last_rejection: String;
        let mut candidate = match segment.outcome {
            SegmentOutcome::Emitted(utterance) => {
                let analysis = analysis::analyze(&utterance.samples, utterance.sample_rate, &self.config.policy.analysis);
                if let Err(reason) = fixed::check_speaker(&analysis, &self.speaker) {
                    return self.reject_capture(reason).await;
                }
                let transcript = match utterance.to_wav() {
                    Ok(bytes) => self.transcribe(bytes).await.unwrap_or_default(),
                    Err(e) => {
                        warn!(error = %e, "failed to encode utterance");
                        String::new()
                    }
                };
                last_rejection = String::new();
                Some(Candidate {
                    transcript,
                    samples: utterance.samples,
                    sample_rate: utterance.sample_rate,
                    chunk_count: utterance.chunk_count,
                })
            }
            SegmentOutcome::Aborted(AbortReason::CallEnded) => {
                return self.failed(FailureKind::CallEnded, RetryClass::Capture);
            }
            SegmentOutcome::Aborted(reason) => {
                last_rejection = reason.as_str().to_string();
                None
            }
        };

        let mut from_fixed = false;
        if candidate.is_none() {
            if self.config.policy.fallback.strict_stream_only {
                return self.failed(FailureKind::NoUtterance { reason: last_rejection }, RetryClass::Capture);
            }
            candidate = self.fixed_fallback(fast_endpoint, &mut last_rejection).await;
            from_fixed = true;
        }
        let Some(mut candidate) = candidate else {
            if !self.live() {
                return self.failed(FailureKind::CallEnded, RetryClass::Capture);
            }
            let retry = match last_rejection.as_str() {
                NO_AUDIO_SOURCE => RetryClass::NoAudio,
                ASR_EMPTY | LOW_QUALITY_TRANSCRIPT => RetryClass::Transcript,
                _ => RetryClass::Capture,
            };
            self.maybe_clarify(&last_rejection).await;
            return self.failed(FailureKind::NoUtterance { reason: last_rejection }, retry);
        };

        if from_fixed
            && self.config.policy.continuation.enabled
            && should_collect_continuation(&candidate.transcript, &self.config.policy.continuation)
        {
            candidate = self.continue_utterance(candidate, fast_endpoint).await;
        }

        let Some(audio_wav) = candidate.wav() else {
            return self.failed(
                FailureKind::NoUtterance {
                    reason: "encode_failed".to_string(),
                },
                RetryClass::Capture,
            );
        };

        let transcript = candidate.transcript.trim().to_string();
        if transcript.is_empty() {
            // nothing recognized locally; the backend transcribes the audio itself
            self.audit.record(AuditEvent::ServerAsr);
        } else {
            self.audit.record(AuditEvent::Transcript {
                text: transcript.clone(),
            });
            let corroboration = if self.gate.needs_corroboration(&transcript) {
                self.transcribe(audio_wav.clone()).await
            } else {
                None
            };
            let (last_reply, since_playback_ms) = {
                let session = self.session.lock();
                (session.last_reply.clone(), session.since_playback_ms(self.now()))
            };
            let ctx = GateContext {
                last_reply: last_reply.as_deref(),
                since_playback_ms,
                corroboration: corroboration.as_deref(),
            };
            match self.gate.evaluate(&transcript, &ctx) {
                GateDecision::Reject(reason) => {
                    info!(reason = %reason, "transcript rejected");
                    self.audit.record(AuditEvent::TranscriptRejected {
                        reason: reason.as_str().to_string(),
                        text: transcript.clone(),
                    });
                    if !reason.is_echo() {
                        self.maybe_clarify(reason.as_str()).await;
                    }
                    let mut report = self.failed(
                        FailureKind::Rejected {
                            reason: reason.as_str().to_string(),
                        },
                        reason.retry_class(),
                    );
                    report.transcript = Some(transcript);
                    return report;
                }
                GateDecision::Accept(_) => self.pin_source(),
            }
        }
        self.flags.mark_activity(self.now());
        if candidate.chunk_count > 1 {
            debug!(chunks = candidate.chunk_count, "assembled utterance");
        }

        let session_id = self.session.lock().backend_session_id.clone();
        let request = TurnRequest {
            session_id,
            transcript_hint: (!transcript.is_empty()).then(|| transcript.clone()),
            skip_asr: !transcript.is_empty(),
            reset_session: false,
            audio_wav: Some(audio_wav),
        };
        let reply = match self.call_backend(request).await {
            Ok(reply) => reply,
            Err(e) => {
                let mut report = self.backend_failed(e);
                report.transcript = Some(transcript);
                return report;
            }
        };
        if let Some(server_transcript) = reply.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
            debug!(transcript = %server_transcript, "backend transcript");
        }

        let mut report = self.speak_reply(reply).await;
        report.transcript = Some(transcript);
        report
    }

    async fn speak_reply(&self, reply: TurnReply) -> TurnReport {
        if reply.reply.trim().is_empty() {
            warn!("backend reply empty");
            self.audit.record(AuditEvent::EmptyReply);
            return self.failed(FailureKind::EmptyReply, RetryClass::Transcript);
        }
        let text = gate::sanitize_reply(&reply.reply, &self.config.policy.reply);
        if self.config.policy.reply.suppress_backend_clarify && gate::is_backend_clarify(&text) {
            info!("suppressing backend clarification reply");
            self.audit.record(AuditEvent::ReplySuppressed);
            return self.failed(FailureKind::SuppressedReply, RetryClass::Capture);
        }
        if self.selector.complete_startup_recovery(&mut self.selection.lock()) {
            self.audit.record(AuditEvent::StartupRecoveryComplete);
        }
        self.deliver(&text, reply.audio_wav.as_deref(), true).await
    }

    /// Plays a reply and records what the caller heard.
    async fn deliver(&self, text: &str, audio: Option<&[u8]>, allow_barge_in: bool) -> TurnReport {
        let playback = match audio {
            Some(bytes) => {
                let probe = allow_barge_in.then_some(&self.barge_in);
                self.supervisor.play(bytes, text, probe).await.result
            }
            None => {
                warn!("backend reply carried no audio");
                self.audit.record(AuditEvent::PlaybackFailed);
                PlaybackResult::Failed
            }
        };
        let now = self.now();

        let mut report = match playback {
            result if result.counts_as_played() => {
                {
                    let mut session = self.session.lock();
                    session.last_reply = Some(text.to_string());
                    session.last_playback_end_ms = Some(now);
                    session.turns += 1;
                }
                self.flags.mark_activity(now);
                self.audit.record(AuditEvent::ReplyPlayed { text: text.to_string() });
                let outcome = match result {
                    PlaybackResult::TimedOut { .. } => TurnOutcome::TimedOut,
                    _ => TurnOutcome::Played,
                };
                let mut report = self.report(outcome, RetryClass::PostPlayback);
                report.retry_after_ms += self.ready_cue().await;
                report
            }
            PlaybackResult::Interrupted => {
                {
                    let mut session = self.session.lock();
                    session.last_reply = Some(text.to_string());
                    session.last_playback_end_ms = Some(now);
                    session.turns += 1;
                }
                self.flags.mark_activity(now);
                self.audit.record(AuditEvent::ReplyInterrupted { text: text.to_string() });
                let mut report = self.report(TurnOutcome::Interrupted, RetryClass::BargeInResume);
                report.retry_after_ms += self.ready_cue().await;
                report
            }
            PlaybackResult::TimedOut { .. } => {
                // Part of the reply may still have reached the caller.
                {
                    let mut session = self.session.lock();
                    session.last_reply = Some(text.to_string());
                    session.last_playback_end_ms = Some(now);
                }
                self.recover_route("playback_timeout");
                self.report(TurnOutcome::TimedOut, RetryClass::PostPlayback)
            }
            PlaybackResult::Played => unreachable!("Played always counts as played"),
            PlaybackResult::Failed => {
                self.recover_route("playback_failed");
                self.flags.mark_activity(now);
                self.failed(FailureKind::Playback, RetryClass::PostPlayback)
            }
        };
        report.reply = Some(text.to_string());
        report
    }

    /// Plays the short "your turn" tone. Returns the extra wait before listening.
    async fn ready_cue(&self) -> u64 {
        let policy = &self.config.policy.ready_cue;
        if !policy.enabled || !self.live() {
            return 0;
        }
        let now = self.now();
        {
            let mut last = self.last_cue_ms.lock();
            if matches!(*last, Some(at) if now.saturating_sub(at) < policy.min_interval_ms) {
                return 0;
            }
            *last = Some(now);
        }
        let cue = match tone::ready_cue_wav(policy) {
            Ok(cue) => cue,
            Err(e) => {
                debug!(error = %e, "ready cue encode failed");
                return 0;
            }
        };
        if self.supervisor.play(&cue, "", None).await.result == PlaybackResult::Failed {
            return 0;
        }
        self.audit.record(AuditEvent::ReadyCue);
        policy.followup_delay_ms
    }

    async fn call_backend(&self, request: TurnRequest) -> Result<TurnReply, BackendError> {
        let limit = Duration::from_millis(self.config.backend.turn_timeout_ms);
        let reply = match tokio::time::timeout(limit, self.parts.backend.turn(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout),
        };
        if let Some(id) = reply.session_id.as_ref().filter(|id| !id.is_empty()) {
            self.session.lock().backend_session_id = Some(id.clone());
        }
        Ok(reply)
    }

    fn backend_failed(&self, error: BackendError) -> TurnReport {
        warn!(kind = error.kind(), error = %error, "dialogue backend call failed");
        self.audit.record(AuditEvent::BackendError {
            kind: error.kind().to_string(),
            detail: error.to_string(),
        });
        self.failed(
            FailureKind::Backend {
                kind: error.kind().to_string(),
            },
            RetryClass::Transcript,
        )
    }

    /// Local transcription. `None` when there is no transcriber or it failed.
    async fn transcribe(&self, wav_bytes: Vec<u8>) -> Option<String> {
        let transcriber = self.parts.transcriber.as_ref()?;
        let limit = Duration::from_millis(self.config.backend.turn_timeout_ms);
        let result = match tokio::time::timeout(limit, transcriber.transcribe(wav_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        };
        match result {
            Ok(transcript) => Some(transcript.trim().to_string()),
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "transcription failed");
                self.audit.record(AuditEvent::BackendError {
                    kind: format!("asr_{}", e.kind()),
                    detail: e.to_string(),
                });
                None
            }
        }
    }

    async fn reject_capture(&self, reason: QualityRejection) -> TurnReport {
        info!(reason = %reason, "capture rejected");
        self.audit.record(AuditEvent::CaptureRejected {
            reason: reason.as_str().to_string(),
        });
        self.maybe_clarify(reason.as_str()).await;
        self.failed(
            FailureKind::Rejected {
                reason: reason.as_str().to_string(),
            },
            RetryClass::Capture,
        )
    }

    /// Speaks a short prompt for `reason`, at most once per cooldown.
    async fn maybe_clarify(&self, reason: &str) -> bool {
        let policy = &self.config.policy.reply;
        if !policy.clarification_enabled || !self.live() {
            return false;
        }
        let Some(synthesizer) = self.parts.synthesizer.as_ref() else {
            return false;
        };
        let now = self.now();
        {
            let mut last = self.last_clarification_ms.lock();
            if matches!(*last, Some(at) if now.saturating_sub(at) < policy.clarification_cooldown_ms) {
                return false;
            }
            *last = Some(now);
        }
        let prompt = clarification_prompt(reason);
        let audio = match synthesizer.synthesize(prompt).await {
            Ok(audio) => audio,
            Err(e) => {
                debug!(error = %e, "clarification synthesis failed");
                return false;
            }
        };
        self.audit.record(AuditEvent::Clarification {
            reason: reason.to_string(),
        });
        self.supervisor.play(&audio, prompt, None).await.result != PlaybackResult::Failed
    }

    fn pin_source(&self) {
        let mut selection = self.selection.lock();
        if self.selector.pin(&mut selection) {
            if let Some(endpoint) = self.selector.endpoint(&selection) {
                self.audit.record(AuditEvent::SourcePinned {
                    endpoint: endpoint.id.clone(),
                });
            }
        }
    }

    /// Probes every endpoint when the selection is uncalibrated and the last
    /// probe is old enough.
    async fn calibrate(&self, force: bool) {
        let now = self.now();
        if !self.selector.needs_calibration(&self.selection.lock(), now, force) {
            return;
        }
        let selector = Arc::clone(&self.selector);
        let capture = Arc::clone(&self.parts.capture);
        let rate = self.config.policy.selector.request_sample_rate;
        let outcome = match tokio::task::spawn_blocking(move || selector.probe(capture.as_ref(), rate)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "calibration probe task failed");
                return;
            }
        };
        let mut selection = self.selection.lock();
        self.selector.apply_probe(&mut selection, &outcome, now);
        match outcome.selected.and_then(|i| self.selector.endpoints().get(i)) {
            Some(endpoint) => {
                info!(endpoint = %endpoint.id, rms = outcome.best_rms(), "capture source calibrated");
                self.audit.record(AuditEvent::SourceCalibrated {
                    endpoint: endpoint.id.clone(),
                    rms: outcome.best_rms(),
                });
            }
            None => {
                self.audit.record(AuditEvent::CalibrationFailed {
                    best_rms: outcome.best_rms(),
                });
            }
        }
    }

    /// Reapplies the audio route in the background, at most once per throttle window.
    fn recover_route(&self, reason: &str) -> bool {
        let now = self.now();
        {
            let mut last = self.last_route_recovery_ms.lock();
            let throttle = self.config.policy.watchdog.route_recover_throttle_ms;
            if matches!(*last, Some(at) if now.saturating_sub(at) < throttle) {
                return false;
            }
            *last = Some(now);
        }
        self.selector.invalidate_calibration(&mut self.selection.lock());
        info!(reason, "recovering audio route");

        let route = Arc::clone(&self.parts.route);
        let audit = Arc::clone(&self.audit);
        let started = self.tasks.spawn("route_recovery", async move {
            let ok = match tokio::task::spawn_blocking(move || route.reapply()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "route reapply failed");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "route reapply task failed");
                    false
                }
            };
            audit.record(AuditEvent::RouteRecovery { ok });
        });
        if !started {
            self.audit.record(AuditEvent::TaskRejected {
                name: "route_recovery".to_string(),
            });
        }
        started
    }

    fn segmenter_driver(&self) -> SegmenterDriver {
        SegmenterDriver {
            policy: self.config.policy.segmenter.clone(),
            capture: Arc::clone(&self.parts.capture),
            call: Arc::clone(&self.parts.call),
            selector: Arc::clone(&self.selector),
            selection: Arc::clone(&self.selection),
            prebuffer: Arc::clone(&self.prebuffer),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.parts.clock),
        }
    }

    fn fixed_capture(&self) -> FixedCapture {
        FixedCapture {
            policy: self.config.policy.analysis.clone(),
            max_merged_ms: self.config.policy.fallback.max_merged_capture_ms,
            capture: Arc::clone(&self.parts.capture),
            selector: Arc::clone(&self.selector),
            selection: Arc::clone(&self.selection),
            prebuffer: Arc::clone(&self.prebuffer),
            speaker: Arc::clone(&self.speaker),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.parts.clock),
        }
    }

    async fn segment(&self, fast_endpoint: bool) -> SegmentReport {
        let driver = self.segmenter_driver();
        match tokio::task::spawn_blocking(move || driver.capture_utterance(fast_endpoint)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "segmentation task failed");
                SegmentReport {
                    outcome: SegmentOutcome::Aborted(AbortReason::LoopTimeout),
                    capture_failures: 0,
                    route_recovery_requested: false,
                }
            }
        }
    }

    async fn capture_fixed(&self, duration_ms: u32, fast_endpoint: bool) -> Option<FixedAttempt> {
        let fixed = self.fixed_capture();
        match tokio::task::spawn_blocking(move || fixed.capture(duration_ms, fast_endpoint)).await {
            Ok(attempt) => Some(attempt),
            Err(e) => {
                warn!(error = %e, "fixed capture task failed");
                None
            }
        }
    }

    /// Fixed-duration capture attempts with growing windows, retrying the same
    /// source once for soft failures and rotating otherwise.
    async fn fixed_fallback(&self, fast_endpoint: bool, last_rejection: &mut String) -> Option<Candidate> {
        let policy = &self.config.policy.fallback;
        let mut same_source_retries = 0u32;
        for (attempt, &duration_ms) in policy.capture_duration_by_attempt_ms.iter().enumerate() {
            if !self.live() {
                return None;
            }
            debug!(attempt = attempt + 1, duration_ms, "fallback capture");
            self.audit.record(AuditEvent::FallbackCapture {
                attempt: attempt as u32 + 1,
                duration_ms,
            });

            let reason = match self.capture_fixed(duration_ms, fast_endpoint).await {
                Some(FixedAttempt::Captured(audio)) => {
                    let transcript = match wav::encode_mono(&audio.samples, audio.sample_rate) {
                        Ok(bytes) => self.transcribe(bytes).await.unwrap_or_default(),
                        Err(_) => String::new(),
                    };
                    if transcript.is_empty() {
                        ASR_EMPTY.to_string()
                    } else if let Some(rejection) = self.gate.is_low_quality(&transcript) {
                        self.audit.record(AuditEvent::TranscriptRejected {
                            reason: rejection.as_str().to_string(),
                            text: transcript,
                        });
                        LOW_QUALITY_TRANSCRIPT.to_string()
                    } else {
                        return Some(Candidate {
                            transcript,
                            samples: audio.samples,
                            sample_rate: audio.sample_rate,
                            chunk_count: 1,
                        });
                    }
                }
                Some(FixedAttempt::NoAudio { response, .. }) => {
                    if response.recover_route {
                        self.recover_route(NO_AUDIO_SOURCE);
                    }
                    NO_AUDIO_SOURCE.to_string()
                }
                Some(FixedAttempt::Rejected { reason, .. }) => reason.as_str().to_string(),
                None => NO_AUDIO_SOURCE.to_string(),
            };

            debug!(reason = %reason, "fallback capture rejected");
            if should_retry_same_source(&reason, same_source_retries, policy.max_same_source_retries) {
                same_source_retries += 1;
            } else {
                same_source_retries = 0;
                let rotated = self.selector.rotate(&mut self.selection.lock()).map(|e| e.id.clone());
                if let Some(endpoint) = rotated {
                    self.audit.record(AuditEvent::SourceRotated { endpoint });
                }
            }
            *last_rejection = reason;
        }
        None
    }

    /// Keeps listening in short windows while the caller seems mid-sentence.
    async fn continue_utterance(&self, seed: Candidate, fast_endpoint: bool) -> Candidate {
        let policy = &self.config.policy.continuation;
        let mut merged = seed;
        let mut boundary_windows = 0u32;
        let mut windows = 0u32;

        for _ in 0..policy.max_windows {
            if !self.live() || merged.chunk_count >= policy.max_chunks {
                break;
            }
            let heard = match self.capture_fixed(policy.capture_ms, fast_endpoint).await {
                Some(FixedAttempt::Captured(audio)) => {
                    let transcript = match wav::encode_mono(&audio.samples, audio.sample_rate) {
                        Ok(bytes) => self.transcribe(bytes).await.unwrap_or_default(),
                        Err(_) => String::new(),
                    };
                    (!transcript.is_empty() && self.gate.is_low_quality(&transcript).is_none())
                        .then_some((transcript, audio))
                }
                Some(FixedAttempt::NoAudio { response, .. }) => {
                    if response.recover_route {
                        self.recover_route(NO_AUDIO_SOURCE);
                    }
                    None
                }
                _ => None,
            };

            let Some((transcript, audio)) = heard else {
                boundary_windows += 1;
                if boundary_windows >= policy.end_boundary_windows {
                    break;
                }
                continue;
            };
            boundary_windows = 0;
            windows += 1;
            merged.transcript = text::join_fragments(&merged.transcript, &transcript);
            merged
                .samples
                .extend(resample::linear(&audio.samples, audio.sample_rate, merged.sample_rate));
            merged.chunk_count += 1;
        }

        let cap = (merged.sample_rate as u64 * policy.max_merged_audio_ms as u64 / 1_000) as usize;
        if merged.samples.len() > cap {
            merged.samples.drain(..merged.samples.len() - cap);
        }
        if windows > 0 {
            let merged_ms = merged.samples.len() as u64 * 1_000 / merged.sample_rate.max(1) as u64;
            self.audit.record(AuditEvent::Continuation { windows, merged_ms });
        }
        merged
    }
}
