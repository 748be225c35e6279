use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::{BackendError, DialogueBackend, Transcriber, TurnReply, TurnRequest};
use crate::config::BackendConfig;

#[derive(Debug, Deserialize)]
struct TurnResponseBody {
    session_id: Option<String>,
    transcript: Option<String>,
    reply: Option<String>,
    audio_wav_base64: Option<String>,
    audio_base64: Option<String>,
    #[serde(rename = "audioBase64")]
    audio_base64_camel: Option<String>,
}

impl TurnResponseBody {
    /// The reply audio may arrive under any of three keys; the first non-blank wins.
    fn audio_field(&self) -> Option<&str> {
        [&self.audio_wav_base64, &self.audio_base64, &self.audio_base64_camel]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct AsrResponseBody {
    #[serde(default)]
    transcript: String,
}

/// Multipart/JSON client for the dialogue backend and its transcription endpoint.
#[derive(Clone)]
pub struct HttpDialogueClient {
    client: Client,
    base_url: String,
    turn_path: String,
    asr_path: String,
    bearer_token: Option<String>,
}

impl HttpDialogueClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            turn_path: config.turn_path.clone(),
            asr_path: config.asr_path.clone(),
            bearer_token: config.bearer_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read error body".to_string());
        Err(BackendError::Status {
            status: status.as_u16(),
            body: body.chars().take(240).collect(),
        })
    }
}

fn wav_part(wav: Vec<u8>) -> Result<Part, BackendError> {
    Part::bytes(wav)
        .file_name("turn.wav")
        .mime_str("audio/wav")
        .map_err(|e| BackendError::Transport(format!("failed to build multipart: {e}")))
}

#[async_trait]
impl DialogueBackend for HttpDialogueClient {
    async fn turn(&self, request: TurnRequest) -> Result<TurnReply, BackendError> {
        debug!(
            session = ?request.session_id,
            skip_asr = request.skip_asr,
            reset_session = request.reset_session,
            audio_bytes = request.audio_wav.as_ref().map(Vec::len).unwrap_or(0),
            "sending turn"
        );
        let mut form = Form::new();
        if let Some(session_id) = request.session_id.filter(|s| !s.is_empty()) {
            form = form.text("session_id", session_id);
        }
        if let Some(hint) = request.transcript_hint.filter(|s| !s.trim().is_empty()) {
            form = form.text("transcript_hint", hint);
        }
        if request.skip_asr {
            form = form.text("skip_asr", "true");
        }
        if request.reset_session {
            form = form.text("reset_session", "true");
        }
        if let Some(wav) = request.audio_wav {
            form = form.part("audio", wav_part(wav)?);
        }

        let response = self
            .authorize(self.client.post(self.url(&self.turn_path)))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        let body: TurnResponseBody =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))?;

        let audio_wav = match body.audio_field() {
            Some(encoded) => Some(
                STANDARD
                    .decode(encoded)
                    .map_err(|e| BackendError::Malformed(format!("reply audio is not base64: {e}")))?,
            ),
            None => None,
        };
        Ok(TurnReply {
            session_id: body.session_id.filter(|s| !s.trim().is_empty()),
            transcript: body.transcript,
            reply: body.reply.unwrap_or_default().trim().to_string(),
            audio_wav,
        })
    }
}

#[async_trait]
impl Transcriber for HttpDialogueClient {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, BackendError> {
        let form = Form::new().part("audio", wav_part(wav)?);
        let response = self
            .authorize(self.client.post(self.url(&self.asr_path)))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await?;
        let body: AsrResponseBody =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(body.transcript.trim().to_string())
    }
}
