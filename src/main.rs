use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley::config::EngineConfig;
use parley::devices::call_state::{SharedCallState, StaticRoute};
use parley::devices::timed_playback::TimedPlayback;
use parley::devices::wav_file::WavFileCapture;
use parley::kernel::time::TokioClock;
use parley::kernel::{CallDirection, Collaborators, TurnOrchestrator};
use parley::services::dialogue::client::HttpDialogueClient;
use parley::services::dialogue::Transcriber;

/// Runs one call against a recorded caller and the dialogue backend.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Args {
    /// Caller audio to replay as the far end of the call.
    #[arg(long)]
    input: PathBuf,

    /// YAML configuration; falls back to PARLEY_CONFIG, then defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat the call as outbound.
    #[arg(long)]
    outbound: bool,

    /// Skip the opening greeting.
    #[arg(long)]
    no_greeting: bool,

    /// Leave transcription to the backend instead of the local ASR endpoint.
    #[arg(long)]
    server_asr: bool,

    /// Read the recording as fast as possible instead of in real time.
    #[arg(long)]
    fast: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::load_from_env().context("loading configuration")?,
    };

    let call = Arc::new(SharedCallState::default());
    let capture = WavFileCapture::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?
        .realtime(!args.fast)
        .end_call_at_eof(Arc::clone(&call));
    let client = Arc::new(HttpDialogueClient::new(&config.backend).context("building backend client")?);
    let transcriber: Option<Arc<dyn Transcriber>> = if args.server_asr {
        None
    } else {
        Some(client.clone() as Arc<dyn Transcriber>)
    };

    let parts = Collaborators {
        call: call.clone(),
        capture: Arc::new(capture),
        playback: Arc::new(TimedPlayback::new()),
        route: Arc::new(StaticRoute::default()),
        backend: client,
        transcriber,
        synthesizer: None,
        clock: Arc::new(TokioClock::new()),
    };
    let direction = if args.outbound {
        CallDirection::Outbound
    } else {
        CallDirection::Inbound
    };

    let engine = Arc::new(TurnOrchestrator::new(config, parts, direction));
    info!(session = %engine.session().id, input = %args.input.display(), "call connected");

    if !args.no_greeting {
        let report = engine.greet().await;
        info!(outcome = report.outcome.as_str(), "greeting finished");
    }

    let audit = engine.audit();
    let runner = Arc::clone(&engine);
    tokio::select! {
        _ = runner.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, ending call");
            engine.stop("interrupted").await;
        }
    }

    let summary = serde_json::to_string_pretty(&audit.summary()).context("serializing summary")?;
    println!("{summary}");
    Ok(())
}
