//! Utterance segmentation.
//!
//! [`Segmenter`] is the pure state machine: it is fed one chunk (or one missed
//! chunk) at a time and says whether to keep listening, emit, or give up.
//! Time is measured in audio consumed, so a finite chunk stream always ends.
//!
//! [`SegmenterDriver`] pulls chunks from a [`CaptureProvider`], negotiates the
//! capture format through the [`SourceSelector`] and feeds the failure policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::prebuffer::RollingPrebuffer;
use super::selector::{FailureContext, SourceSelectionState, SourceSelector};
use crate::audio::resample;
use crate::audio::vad::ChunkClassifier;
use crate::audio::wav::{self, WavError};
use crate::config::SegmenterPolicy;
use crate::devices::{AudioFrame, CallStateProvider, CaptureProvider};
use crate::kernel::audit::{AuditEvent, AuditTrail};
use crate::kernel::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Speaking,
    Emit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Silence,
    MaxTurn,
    LoopTimeout,
    Eof,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::MaxTurn => "max_turn",
            Self::LoopTimeout => "loop_timeout",
            Self::Eof => "eof",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    NoSpeechTimeout,
    LoopTimeout,
    CallEnded,
    InsufficientSpeech,
    NoCaptureSource,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSpeechTimeout => "no_speech_timeout",
            Self::LoopTimeout => "loop_timeout",
            Self::CallEnded => "call_ended",
            Self::InsufficientSpeech => "insufficient_speech",
            Self::NoCaptureSource => "no_capture_source",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Emit(EndReason),
    Abort(AbortReason),
}

/// One caller speech segment, ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Empty means "forward the audio and let the backend transcribe it".
    pub transcript: String,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub chunk_count: u32,
    pub speech_samples: usize,
    pub end_reason: EndReason,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1_000 / self.sample_rate as u64
    }

    pub fn to_wav(&self) -> Result<Vec<u8>, WavError> {
        wav::encode_mono(&self.samples, self.sample_rate)
    }
}

#[derive(Debug)]
pub enum SegmentOutcome {
    Emitted(Utterance),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Thresholds {
    pre_roll: usize,
    min_speech: usize,
    silence_limit: usize,
    max_turn: usize,
}

fn samples_for(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1_000) as usize
}

pub struct Segmenter {
    policy: SegmenterPolicy,
    fast_endpoint: bool,
    state: SegmenterState,
    /// The step that ended the attempt, repeated to any later input.
    terminal: Option<Step>,
    sample_rate: u32,
    thresholds: Thresholds,
    pre_roll: HeapRb<i16>,
    buffer: Vec<i16>,
    speech_samples: usize,
    silence_samples: usize,
    chunk_count: u32,
    elapsed_ms: u64,
}

impl Segmenter {
    /// `fast_endpoint` shortens the closing silence, for turns that start right
    /// after the assistant finished talking.
    pub fn new(policy: SegmenterPolicy, sample_rate: u32, fast_endpoint: bool) -> Self {
        let thresholds = Self::thresholds_for(&policy, sample_rate, fast_endpoint);
        Self {
            pre_roll: HeapRb::new(thresholds.pre_roll.max(1)),
            policy,
            fast_endpoint,
            state: SegmenterState::Idle,
            terminal: None,
            sample_rate,
            thresholds,
            buffer: Vec::new(),
            speech_samples: 0,
            silence_samples: 0,
            chunk_count: 0,
            elapsed_ms: 0,
        }
    }

    fn thresholds_for(policy: &SegmenterPolicy, sample_rate: u32, fast_endpoint: bool) -> Thresholds {
        let silence_ms = if fast_endpoint {
            policy.fast_post_playback_silence_ms
        } else {
            policy.silence_ms
        };
        Thresholds {
            pre_roll: samples_for(sample_rate, policy.pre_roll_ms),
            min_speech: samples_for(sample_rate, policy.min_speech_ms),
            silence_limit: samples_for(sample_rate, silence_ms),
            max_turn: samples_for(sample_rate, policy.max_turn_ms),
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn speech_samples(&self) -> usize {
        self.speech_samples
    }

    pub fn silence_samples(&self) -> usize {
        self.silence_samples
    }

    pub fn min_speech_samples(&self) -> usize {
        self.thresholds.min_speech
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_fast_endpoint(&self) -> bool {
        self.fast_endpoint
    }

    /// Re-expresses everything accumulated so far at `sample_rate`, so a
    /// renegotiated capture format does not restart the turn.
    fn rebase(&mut self, sample_rate: u32) {
        if sample_rate == 0 || sample_rate == self.sample_rate {
            return;
        }
        let old = self.sample_rate;
        debug!(from = old, to = sample_rate, "segmenter sample rate changed");
        self.buffer = resample::linear(&self.buffer, old, sample_rate);
        let scale = |n: usize| (n as u64 * sample_rate as u64 / old.max(1) as u64) as usize;
        self.speech_samples = scale(self.speech_samples);
        self.silence_samples = scale(self.silence_samples);
        self.thresholds = Self::thresholds_for(&self.policy, sample_rate, self.fast_endpoint);

        let carried: Vec<i16> = self.pre_roll.pop_iter().collect();
        let mut ring = HeapRb::new(self.thresholds.pre_roll.max(1));
        ring.push_slice_overwrite(&resample::linear(&carried, old, sample_rate));
        self.pre_roll = ring;
        self.sample_rate = sample_rate;
    }

    /// The emit or abort this attempt already ended with, if any.
    pub fn terminal_step(&self) -> Option<Step> {
        self.terminal
    }

    fn is_terminal(&self) -> Option<Step> {
        match self.state {
            SegmenterState::Emit | SegmenterState::Abort => self.terminal,
            _ => None,
        }
    }

    /// Feeds one captured chunk.
    pub fn on_chunk(&mut self, frame: &AudioFrame, voiced: bool, prebuffer: &RollingPrebuffer) -> Step {
        if let Some(step) = self.is_terminal() {
            return step;
        }
        if frame.is_empty() {
            return self.on_missing_chunk();
        }
        self.rebase(frame.sample_rate);
        let elapsed_before = self.elapsed_ms;
        self.elapsed_ms += frame.duration_ms().max(1);
        let chunk_len = frame.samples.len();

        match self.state {
            SegmenterState::Idle if !voiced => {
                self.pre_roll.push_slice_overwrite(&frame.samples);
                prebuffer.append(&frame.samples, frame.sample_rate);
                if elapsed_before >= self.policy.no_speech_timeout_ms as u64 {
                    return self.abort(AbortReason::NoSpeechTimeout);
                }
                return self.check_loop_timeout();
            }
            SegmenterState::Idle => {
                // onset: seed with whichever pre-speech history is longer
                let carried = prebuffer.take(self.sample_rate);
                let local: Vec<i16> = self.pre_roll.pop_iter().collect();
                self.buffer = if carried.len() >= local.len() { carried } else { local };
                self.state = SegmenterState::Speaking;
                self.speech_samples = chunk_len;
                self.silence_samples = 0;
            }
            _ if voiced => {
                self.speech_samples += chunk_len;
                self.silence_samples = 0;
            }
            _ => {
                self.silence_samples += chunk_len;
            }
        }

        self.buffer.extend_from_slice(&frame.samples);
        prebuffer.append(&frame.samples, frame.sample_rate);
        self.chunk_count += 1;

        if self.buffer.len() >= self.thresholds.max_turn {
            return self.finish(EndReason::MaxTurn);
        }
        if self.silence_samples >= self.thresholds.silence_limit && self.speech_samples >= self.thresholds.min_speech {
            return self.finish(EndReason::Silence);
        }
        self.check_loop_timeout()
    }

    /// Accounts for a read that produced nothing. While speaking this counts
    /// as silence; while idle it only advances the no-speech clock.
    pub fn on_missing_chunk(&mut self) -> Step {
        if let Some(step) = self.is_terminal() {
            return step;
        }
        let elapsed_before = self.elapsed_ms;
        self.elapsed_ms += self.policy.chunk_ms.max(1) as u64;
        match self.state {
            SegmenterState::Speaking => {
                self.silence_samples += samples_for(self.sample_rate, self.policy.chunk_ms);
                if self.silence_samples >= self.thresholds.silence_limit
                    && self.speech_samples >= self.thresholds.min_speech
                {
                    return self.finish(EndReason::Silence);
                }
            }
            _ => {
                if elapsed_before >= self.policy.no_speech_timeout_ms as u64 {
                    return self.abort(AbortReason::NoSpeechTimeout);
                }
            }
        }
        self.check_loop_timeout()
    }

    fn check_loop_timeout(&mut self) -> Step {
        if self.elapsed_ms >= self.policy.loop_timeout_ms as u64 {
            return self.on_timeout();
        }
        Step::Continue
    }

    /// The attempt ran out of time: emit what was heard if it is enough.
    pub fn on_timeout(&mut self) -> Step {
        if let Some(step) = self.is_terminal() {
            return step;
        }
        if self.state == SegmenterState::Speaking {
            return self.finish(EndReason::LoopTimeout);
        }
        self.abort(AbortReason::LoopTimeout)
    }

    /// The input stream ended.
    pub fn on_eof(&mut self) -> Step {
        if let Some(step) = self.is_terminal() {
            return step;
        }
        if self.state == SegmenterState::Speaking {
            return self.finish(EndReason::Eof);
        }
        self.abort(AbortReason::InsufficientSpeech)
    }

    fn finish(&mut self, reason: EndReason) -> Step {
        if self.speech_samples < self.thresholds.min_speech || self.buffer.is_empty() {
            return self.abort(AbortReason::InsufficientSpeech);
        }
        self.state = SegmenterState::Emit;
        self.terminal = Some(Step::Emit(reason));
        Step::Emit(reason)
    }

    fn abort(&mut self, reason: AbortReason) -> Step {
        self.state = SegmenterState::Abort;
        self.terminal = Some(Step::Abort(reason));
        Step::Abort(reason)
    }

    /// Packages the buffer after `Step::Emit`, capped at the maximum turn
    /// length, clears the carried pre-buffer and returns to `Idle`.
    pub fn take_utterance(&mut self, end_reason: EndReason, prebuffer: &RollingPrebuffer) -> Utterance {
        let mut samples = std::mem::take(&mut self.buffer);
        if self.thresholds.max_turn > 0 && samples.len() > self.thresholds.max_turn {
            samples.truncate(self.thresholds.max_turn);
        }
        prebuffer.clear();
        let utterance = Utterance {
            transcript: String::new(),
            samples,
            sample_rate: self.sample_rate,
            chunk_count: self.chunk_count.max(1),
            speech_samples: self.speech_samples,
            end_reason,
        };
        self.reset();
        utterance
    }

    /// Back to `Idle` with empty counters, keeping the current sample rate.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.terminal = None;
        self.buffer.clear();
        self.pre_roll = HeapRb::new(self.thresholds.pre_roll.max(1));
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.chunk_count = 0;
        self.elapsed_ms = 0;
    }
}

#[derive(Debug)]
pub struct SegmentReport {
    pub outcome: SegmentOutcome,
    pub capture_failures: u32,
    pub route_recovery_requested: bool,
}

/// Pulls chunks from the capture provider until the segmenter emits or aborts.
/// Blocking; run it on a blocking thread.
#[derive(Clone)]
pub struct SegmenterDriver {
    pub policy: SegmenterPolicy,
    pub capture: Arc<dyn CaptureProvider>,
    pub call: Arc<dyn CallStateProvider>,
    pub selector: Arc<SourceSelector>,
    pub selection: Arc<Mutex<SourceSelectionState>>,
    pub prebuffer: Arc<RollingPrebuffer>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<dyn Clock>,
}

impl SegmenterDriver {
    pub fn capture_utterance(&self, fast_endpoint: bool) -> SegmentReport {
        let sample_rate = {
            let selection = self.selection.lock();
            selection
                .current_sample_rate
                .unwrap_or(self.selector.policy().request_sample_rate)
        };
        let mut segmenter = Segmenter::new(self.policy.clone(), sample_rate, fast_endpoint);
        let mut classifier = ChunkClassifier::new(&self.policy);
        let wall_deadline = Instant::now() + Duration::from_millis(self.policy.loop_timeout_ms as u64);
        let mut report = SegmentReport {
            outcome: SegmentOutcome::Aborted(AbortReason::LoopTimeout),
            capture_failures: 0,
            route_recovery_requested: false,
        };

        loop {
            if !self.call.is_call_active() {
                report.outcome = SegmentOutcome::Aborted(AbortReason::CallEnded);
                return report;
            }
            let step = if Instant::now() >= wall_deadline {
                segmenter.on_timeout()
            } else {
                match self.read_chunk() {
                    ChunkRead::Frame(frame) => {
                        let voiced = classifier.is_voiced(&frame.samples, frame.sample_rate);
                        segmenter.on_chunk(&frame, voiced, &self.prebuffer)
                    }
                    ChunkRead::NoSource => {
                        report.outcome = SegmentOutcome::Aborted(AbortReason::NoCaptureSource);
                        return report;
                    }
                    ChunkRead::Missing(endpoint_id) => {
                        report.capture_failures += 1;
                        let speaking = segmenter.state() == SegmenterState::Speaking;
                        report.route_recovery_requested |=
                            self.handle_failure(&endpoint_id, speaking, fast_endpoint);
                        segmenter.on_missing_chunk()
                    }
                }
            };

            match step {
                Step::Continue => continue,
                Step::Emit(reason) => {
                    let utterance = segmenter.take_utterance(reason, &self.prebuffer);
                    info!(
                        chunks = utterance.chunk_count,
                        duration_ms = utterance.duration_ms(),
                        end_reason = reason.as_str(),
                        "utterance emitted"
                    );
                    self.audit.record(AuditEvent::UtteranceEmitted {
                        chunks: utterance.chunk_count,
                        duration_ms: utterance.duration_ms(),
                        end_reason: reason.as_str().to_string(),
                    });
                    report.outcome = SegmentOutcome::Emitted(utterance);
                    return report;
                }
                Step::Abort(reason) => {
                    debug!(reason = reason.as_str(), "segmentation aborted");
                    self.audit.record(AuditEvent::SegmentationAborted {
                        reason: reason.as_str().to_string(),
                    });
                    report.outcome = SegmentOutcome::Aborted(reason);
                    return report;
                }
            }
        }
    }

    fn read_chunk(&self) -> ChunkRead {
        let (endpoint_id, formats) = {
            let selection = self.selection.lock();
            let Some(endpoint) = self.selector.endpoint(&selection) else {
                return ChunkRead::NoSource;
            };
            (endpoint.id.clone(), self.selector.capture_formats(&selection))
        };
        for format in formats {
            match self
                .capture
                .read_chunk(&endpoint_id, self.policy.chunk_ms, format.sample_rate, format.channels)
            {
                Ok(Some(frame)) if !frame.is_empty() => {
                    let mut selection = self.selection.lock();
                    self.selector.record_format(&mut selection, format);
                    self.selector.record_success(&mut selection);
                    return ChunkRead::Frame(frame);
                }
                Ok(_) => {}
                Err(e) => debug!(endpoint = %endpoint_id, error = %e, "capture read failed"),
            }
        }
        ChunkRead::Missing(endpoint_id)
    }

    fn handle_failure(&self, endpoint_id: &str, speaking: bool, fast_endpoint: bool) -> bool {
        let response = {
            let mut selection = self.selection.lock();
            self.selector.record_failure(
                &mut selection,
                FailureContext {
                    now_ms: self.clock.now_ms(),
                    speaking,
                    fast_endpoint,
                },
            )
        };
        self.audit.record(AuditEvent::CaptureFailure {
            endpoint: endpoint_id.to_string(),
            streak: response.failures,
        });
        if response.restart_stream {
            self.capture.restart_stream(endpoint_id);
            self.audit.record(AuditEvent::StreamRestarted {
                endpoint: endpoint_id.to_string(),
            });
        }
        if response.unpinned {
            self.audit.record(AuditEvent::SourceUnpinned {
                reason: format!("no_audio_streak_{}", response.failures),
            });
        }
        if let Some(next) = &response.rotated_to {
            warn!(from = endpoint_id, to = %next, "rotating capture source");
            if next != endpoint_id {
                self.capture.restart_stream(endpoint_id);
            }
            self.audit.record(AuditEvent::SourceRotated { endpoint: next.clone() });
        }
        response.recover_route
    }
}

enum ChunkRead {
    Frame(AudioFrame),
    Missing(String),
    NoSource,
}
