#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley::audio::wav;
use parley::config::EngineConfig;
use parley::devices::call_state::{SharedCallState, StaticRoute};
use parley::devices::timed_playback::TimedPlayback;
use parley::devices::{AudioFrame, CaptureEndpoint, CaptureProvider, DeviceError, PlaybackTarget};
use parley::kernel::audit::AuditLevel;
use parley::kernel::time::ManualClock;
use parley::kernel::{CallDirection, Collaborators, TurnOrchestrator};
use parley::services::dialogue::{
    BackendError, DialogueBackend, Synthesizer, Transcriber, TurnReply, TurnRequest,
};

pub const RATE: u32 = 16_000;
pub const CHUNK_MS: u32 = 120;

/// Envelope applied per 20ms frame so the signal has the level spread of speech.
const ENVELOPE: [f64; 4] = [1.0, 0.5, 0.8, 0.3];

/// Alternating-sign samples whose level follows a speech-like envelope.
pub fn speech_like(amplitude: i16, ms: u32, rate: u32) -> Vec<i16> {
    let total = (rate as u64 * ms as u64 / 1_000) as usize;
    let frame = (rate / 50).max(1) as usize;
    (0..total)
        .map(|n| {
            let level = (amplitude as f64 * ENVELOPE[(n / frame) % ENVELOPE.len()]) as i16;
            if n % 2 == 0 {
                level
            } else {
                -level
            }
        })
        .collect()
}

pub fn silence(ms: u32, rate: u32) -> Vec<i16> {
    vec![0; (rate as u64 * ms as u64 / 1_000) as usize]
}

pub fn speech_wav(ms: u32) -> Vec<u8> {
    wav::encode_mono(&speech_like(3_000, ms, RATE), RATE).expect("encode test wav")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Chunk {
    /// Speech-like audio at this peak level; zero is digital silence.
    Level(i16),
    /// The read returns nothing.
    Missing,
}

/// Capture provider driven by a script.
///
/// Reads of the streaming chunk length pop the main script and fall back to
/// silence once it runs out. Reads of any other length (probes, fixed captures,
/// barge-in clips) pop a queue kept per duration and fall back to speech at
/// `default_level`.
pub struct ScriptedCapture {
    chunk_ms: u32,
    default_level: i16,
    script: Mutex<VecDeque<Chunk>>,
    windows: Mutex<HashMap<u32, VecDeque<Chunk>>>,
    reads: Mutex<Vec<(String, u32)>>,
    restarts: AtomicUsize,
}

impl ScriptedCapture {
    pub fn new(chunk_ms: u32) -> Self {
        Self {
            chunk_ms,
            default_level: 1_200,
            script: Mutex::new(VecDeque::new()),
            windows: Mutex::new(HashMap::new()),
            reads: Mutex::new(Vec::new()),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn with_default_level(mut self, level: i16) -> Self {
        self.default_level = level;
        self
    }

    pub fn push(&self, chunk: Chunk, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(chunk);
        }
    }

    /// Quiet lead-in, `speech_chunks` of speech, then enough silence to close the turn.
    pub fn push_turn(&self, speech_chunks: usize) {
        self.push(Chunk::Level(0), 3);
        self.push(Chunk::Level(2_000), speech_chunks);
        self.push(Chunk::Level(0), 5);
    }

    pub fn push_window(&self, duration_ms: u32, chunk: Chunk) {
        self.windows.lock().entry(duration_ms).or_default().push_back(chunk);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    pub fn reads(&self) -> Vec<(String, u32)> {
        self.reads.lock().clone()
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl CaptureProvider for ScriptedCapture {
    fn read_chunk(
        &self,
        endpoint_id: &str,
        duration_ms: u32,
        sample_rate: u32,
        _channels: u16,
    ) -> Result<Option<AudioFrame>, DeviceError> {
        self.reads.lock().push((endpoint_id.to_string(), duration_ms));
        let chunk = if duration_ms == self.chunk_ms {
            self.script.lock().pop_front().unwrap_or(Chunk::Level(0))
        } else {
            self.windows
                .lock()
                .get_mut(&duration_ms)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Chunk::Level(self.default_level))
        };
        Ok(match chunk {
            Chunk::Missing => None,
            Chunk::Level(0) => Some(AudioFrame::new(silence(duration_ms, sample_rate), sample_rate, 0)),
            Chunk::Level(level) => Some(AudioFrame::new(
                speech_like(level, duration_ms, sample_rate),
                sample_rate,
                0,
            )),
        })
    }

    fn restart_stream(&self, _endpoint_id: &str) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Replies in order; an empty queue answers with a transport error.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<TurnReply, BackendError>>>,
    requests: Mutex<Vec<TurnRequest>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Result<TurnReply, BackendError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_reply(&self, text: &str) {
        self.push(Ok(spoken_reply(text)));
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }
}

pub fn spoken_reply(text: &str) -> TurnReply {
    TurnReply {
        session_id: Some("conv-1".to_string()),
        transcript: None,
        reply: text.to_string(),
        audio_wav: Some(speech_wav(200)),
    }
}

#[async_trait]
impl DialogueBackend for ScriptedBackend {
    async fn turn(&self, request: TurnRequest) -> Result<TurnReply, BackendError> {
        self.requests.lock().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Transport("no scripted reply".to_string())))
    }
}

/// Transcripts in order; an empty queue recognizes nothing.
#[derive(Default)]
pub struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transcript: &str) {
        self.transcripts.lock().push_back(Ok(transcript.to_string()));
    }

    pub fn push_err(&self, error: BackendError) {
        self.transcripts.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _wav: Vec<u8>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.transcripts.lock().pop_front().unwrap_or_else(|| Ok(String::new()))
    }
}

#[derive(Default)]
pub struct FakeSynthesizer {
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendError> {
        self.prompts.lock().push(text.to_string());
        Ok(speech_wav(150))
    }
}

/// One 16 kHz mono endpoint and target, no cue, no pre-arm and no WebRTC VAD.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.capture_endpoints = vec![CaptureEndpoint::new("mic0", "test mic")];
    config.playback_targets = vec![PlaybackTarget::new("spk0", RATE, 1, 1.0)];
    config.audit.level = AuditLevel::Verbose;

    let policy = &mut config.policy;
    policy.selector.request_sample_rate = RATE;
    policy.selector.sample_rate_candidates = vec![RATE];
    policy.selector.primary_channels = 1;
    policy.selector.channel_candidates = vec![1];
    policy.segmenter.chunk_ms = CHUNK_MS;
    policy.segmenter.use_webrtc_vad = false;
    policy.ready_cue.enabled = false;
    policy.playback.prearm_enabled = false;
    policy.playback.poll_ms = 10;
    config
}

/// Fakes for every collaborator, kept around so tests can inspect them.
pub struct Harness {
    pub call: Arc<SharedCallState>,
    pub capture: Arc<ScriptedCapture>,
    pub playback: Arc<TimedPlayback>,
    pub route: Arc<StaticRoute>,
    pub backend: Arc<ScriptedBackend>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(ScriptedBackend::new())
    }

    pub fn with_backend(backend: ScriptedBackend) -> Self {
        Self {
            call: Arc::new(SharedCallState::default()),
            capture: Arc::new(ScriptedCapture::new(CHUNK_MS)),
            playback: Arc::new(TimedPlayback::new()),
            route: Arc::new(StaticRoute::default()),
            backend: Arc::new(backend),
            transcriber: Arc::new(ScriptedTranscriber::new()),
            synthesizer: Arc::new(FakeSynthesizer::default()),
            clock: Arc::new(ManualClock::new(1_000)),
        }
    }

    pub fn parts(&self) -> Collaborators {
        Collaborators {
            call: self.call.clone(),
            capture: self.capture.clone(),
            playback: self.playback.clone(),
            route: self.route.clone(),
            backend: self.backend.clone(),
            transcriber: Some(self.transcriber.clone() as Arc<dyn Transcriber>),
            synthesizer: Some(self.synthesizer.clone() as Arc<dyn Synthesizer>),
            clock: self.clock.clone(),
        }
    }

    pub fn engine(&self, config: EngineConfig) -> Arc<TurnOrchestrator> {
        Arc::new(TurnOrchestrator::new(config, self.parts(), CallDirection::Inbound))
    }
}
