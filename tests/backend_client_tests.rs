use std::time::Duration;

use parley::config::BackendConfig;
use parley::services::dialogue::{BackendError, DialogueBackend, HttpDialogueClient, Transcriber, TurnRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Answers exactly one HTTP request and hands back the raw request text.
async fn serve_once(status: u16, body: &str, delay: Duration) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let body = body.to_string();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let request = read_request(&mut socket).await;
        tokio::time::sleep(delay).await;
        let response = format!(
            "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
        request
    });
    (format!("http://{addr}"), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.expect("read");
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw).to_string();
        let Some(split) = text.find("\r\n\r\n") else {
            continue;
        };
        let headers = text[..split].to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let received = raw.len() - (split + 4);
        match content_length {
            Some(length) if received >= length => break,
            None if text.ends_with("0\r\n\r\n") => break,
            _ => {}
        }
    }
    String::from_utf8_lossy(&raw).to_string()
}

fn client(base_url: &str) -> HttpDialogueClient {
    HttpDialogueClient::new(&BackendConfig {
        base_url: format!("{base_url}/"),
        bearer_token: Some("secret".to_string()),
        connect_timeout_ms: 1_000,
        read_timeout_ms: 2_000,
        ..BackendConfig::default()
    })
    .expect("client builds")
}

#[tokio::test]
async fn test_turn_sends_multipart_and_parses_reply() {
    // 1. Backend answers with a session, a reply and base64 audio ("RIFF")
    let (url, server) = serve_once(
        200,
        r#"{"session_id":"conv-7","transcript":"a table for two","reply":"  Sure thing.  ","audio_base64":"UklGRg=="}"#,
        Duration::ZERO,
    )
    .await;

    // 2. Send a turn with every field set except reset
    let reply = client(&url)
        .turn(TurnRequest {
            session_id: Some("conv-7".to_string()),
            transcript_hint: Some("a table for two".to_string()),
            skip_asr: true,
            reset_session: false,
            audio_wav: Some(b"RIFFdata".to_vec()),
        })
        .await
        .expect("turn succeeds");

    // 3. Reply parsed and trimmed
    assert_eq!(reply.session_id.as_deref(), Some("conv-7"));
    assert_eq!(reply.transcript.as_deref(), Some("a table for two"));
    assert_eq!(reply.reply, "Sure thing.");
    assert_eq!(reply.audio_wav.as_deref(), Some(&b"RIFF"[..]));

    // 4. Request carried the expected form fields
    let request = server.await.expect("server");
    let lower = request.to_lowercase();
    assert!(lower.starts_with("post /api/turn "), "request line: {}", request.lines().next().unwrap_or(""));
    assert!(lower.contains("authorization: bearer secret"));
    assert!(request.contains(r#"name="session_id""#));
    assert!(request.contains(r#"name="transcript_hint""#));
    assert!(request.contains(r#"name="skip_asr""#));
    assert!(!request.contains(r#"name="reset_session""#));
    assert!(request.contains(r#"filename="turn.wav""#));
    assert!(request.contains("audio/wav"));
}

#[tokio::test]
async fn test_reply_audio_accepts_every_key() {
    for body in [
        r#"{"reply":"ok","audio_wav_base64":"UklGRg=="}"#,
        r#"{"reply":"ok","audio_base64":"UklGRg=="}"#,
        r#"{"reply":"ok","audio_wav_base64":"  ","audioBase64":"UklGRg=="}"#,
    ] {
        let (url, _server) = serve_once(200, body, Duration::ZERO).await;
        let reply = client(&url)
            .turn(TurnRequest::default())
            .await
            .expect("turn succeeds");
        assert_eq!(reply.audio_wav.as_deref(), Some(&b"RIFF"[..]), "body {body}");
    }
}

#[tokio::test]
async fn test_reset_turn_without_audio() {
    let (url, server) = serve_once(200, r#"{"session_id":"","reply":"Hello!"}"#, Duration::ZERO).await;

    let reply = client(&url)
        .turn(TurnRequest {
            reset_session: true,
            ..TurnRequest::default()
        })
        .await
        .expect("turn succeeds");

    assert_eq!(reply.session_id, None, "blank session ids are dropped");
    assert_eq!(reply.audio_wav, None);
    let request = server.await.expect("server");
    assert!(request.contains(r#"name="reset_session""#));
    assert!(!request.contains(r#"name="audio""#));
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let (url, _server) = serve_once(503, "overloaded", Duration::ZERO).await;

    let err = client(&url).turn(TurnRequest::default()).await.expect_err("must fail");

    assert_eq!(
        err,
        BackendError::Status {
            status: 503,
            body: "overloaded".to_string()
        }
    );
    assert_eq!(err.kind(), "status");
}

#[tokio::test]
async fn test_malformed_body_is_reported() {
    let (url, _server) = serve_once(200, "<html>oops</html>", Duration::ZERO).await;

    let err = client(&url).turn(TurnRequest::default()).await.expect_err("must fail");

    assert!(matches!(err, BackendError::Malformed(_)), "got {err:?}");
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let (url, _server) = serve_once(200, r#"{"reply":"late"}"#, Duration::from_millis(1_500)).await;
    let client = HttpDialogueClient::new(&BackendConfig {
        base_url: url,
        read_timeout_ms: 200,
        ..BackendConfig::default()
    })
    .expect("client builds");

    let err = client.turn(TurnRequest::default()).await.expect_err("must time out");

    assert_eq!(err, BackendError::Timeout);
}

#[tokio::test]
async fn test_refused_connection_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = client(&format!("http://{addr}"))
        .turn(TurnRequest::default())
        .await
        .expect_err("must fail");

    assert_eq!(err.kind(), "connect");
}

#[tokio::test]
async fn test_transcribe_posts_to_asr_path() {
    let (url, server) = serve_once(200, r#"{"transcript":"  hello there "}"#, Duration::ZERO).await;

    let transcript = client(&url).transcribe(b"RIFF".to_vec()).await.expect("transcribes");

    assert_eq!(transcript, "hello there");
    let request = server.await.expect("server");
    assert!(request.to_lowercase().starts_with("post /api/asr "));
    assert!(request.contains(r#"name="audio""#));
}
