//! The remote dialogue backend and the speech services around it.
//!
//! The engine only depends on the traits here; [`client::HttpDialogueClient`]
//! is the multipart/JSON implementation.
pub mod client;

use async_trait::async_trait;
use thiserror::Error;

pub use client::HttpDialogueClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,
    #[error("could not connect to backend: {0}")]
    Connect(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Malformed(String),
    #[error("backend transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Malformed(_) => "malformed",
            Self::Transport(_) => "transport",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// One turn sent to the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub session_id: Option<String>,
    pub transcript_hint: Option<String>,
    /// The hint is authoritative; the backend should not transcribe the audio.
    pub skip_asr: bool,
    /// Start a fresh conversation, used for the greeting.
    pub reset_session: bool,
    pub audio_wav: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReply {
    pub session_id: Option<String>,
    pub transcript: Option<String>,
    pub reply: String,
    /// Synthesized reply speech as a WAV container.
    pub audio_wav: Option<Vec<u8>>,
}

#[async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn turn(&self, request: TurnRequest) -> Result<TurnReply, BackendError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes a WAV buffer; an empty string means nothing was recognized.
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, BackendError>;
}

/// Local speech synthesis for short prompts that do not go through the backend.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendError>;
}
