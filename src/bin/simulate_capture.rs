//! Offline stream-capture simulation.
//!
//! Replays WAV recordings through the segmenter in fixed chunks, compares the
//! emitted turns against a fine-grained reference detector and reports where
//! turn starts or ends were clipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley::audio::analysis;
use parley::audio::vad::ChunkClassifier;
use parley::audio::wav;
use parley::capture::prebuffer::RollingPrebuffer;
use parley::capture::segmenter::{EndReason, Segmenter, Step};
use parley::config::{SegmenterPolicy, TurnPolicy};
use parley::devices::AudioFrame;

/// Turns within this distance of a previous capped turn continue it.
const CONTINUATION_WINDOW_MS: u32 = 260;
const REPORT_TURN_LIMIT: usize = 40;

#[derive(Debug, Parser)]
#[command(name = "simulate_capture", about = "Replay WAV files through the utterance segmenter")]
struct Args {
    /// WAV file or directory of WAV files; repeatable.
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,

    #[arg(long)]
    outdir: Option<PathBuf>,

    #[arg(long)]
    no_emit_turn_wavs: bool,

    #[arg(long, default_value_t = 200)]
    max_turns: usize,

    #[arg(long)]
    chunk_ms: Option<u32>,
    #[arg(long)]
    pre_roll_ms: Option<u32>,
    #[arg(long)]
    min_speech_ms: Option<u32>,
    #[arg(long)]
    silence_ms: Option<u32>,
    #[arg(long)]
    max_turn_ms: Option<u32>,
    #[arg(long)]
    loop_timeout_ms: Option<u32>,

    #[arg(long, default_value_t = 140)]
    post_turn_gap_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ReferenceConfig {
    frame_ms: u32,
    vad_rms: f64,
    silence_ms: u32,
    min_speech_ms: u32,
    start_clip_warn_ms: f64,
    end_clip_warn_ms: f64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            vad_rms: 55.0,
            silence_ms: 620,
            min_speech_ms: 220,
            start_clip_warn_ms: 180.0,
            end_clip_warn_ms: 260.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SimulationConfig {
    segmenter: SegmenterPolicy,
    post_turn_gap_ms: u32,
    reference: ReferenceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn overlap(&self, other: &Span) -> usize {
        self.end.min(other.end).saturating_sub(self.start.max(other.start))
    }
}

fn samples_for(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1_000) as usize
}

fn to_ms(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 * 1_000.0 / sample_rate.max(1) as f64
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Frame-level energy detector used as ground truth.
fn reference_utterances(samples: &[i16], sample_rate: u32, config: &ReferenceConfig) -> Vec<Span> {
    let frame = samples_for(sample_rate, config.frame_ms).max(1);
    let silence_limit = samples_for(sample_rate, config.silence_ms);
    let min_speech = samples_for(sample_rate, config.min_speech_ms);
    let mut spans = Vec::new();
    let mut speaking = false;
    let (mut start, mut speech, mut silence) = (0usize, 0usize, 0usize);

    for (index, chunk) in samples.chunks(frame).enumerate() {
        let offset = index * frame;
        let voiced = analysis::rms(chunk) >= config.vad_rms;
        if !speaking {
            if voiced {
                speaking = true;
                start = offset;
                speech = chunk.len();
                silence = 0;
            }
            continue;
        }
        if voiced {
            speech += chunk.len();
            silence = 0;
            continue;
        }
        silence += chunk.len();
        if silence >= silence_limit {
            let end = offset + chunk.len() - silence;
            if speech >= min_speech && end > start {
                spans.push(Span { start, end });
            }
            speaking = false;
            speech = 0;
            silence = 0;
        }
    }
    if speaking && speech >= min_speech {
        spans.push(Span {
            start,
            end: samples.len(),
        });
    }
    spans
}

struct CapturedTurn {
    span: Span,
    end_reason: EndReason,
    speech_samples: usize,
    chunk_count: u32,
    samples: Vec<i16>,
    next_index: usize,
}

/// Runs the segmenter from `start` until it emits or gives up. `Err` carries
/// the position reached.
fn capture_turn(samples: &[i16], sample_rate: u32, start: usize, policy: &SegmenterPolicy) -> Result<CapturedTurn, usize> {
    let mut segmenter = Segmenter::new(policy.clone(), sample_rate, false);
    let mut classifier = ChunkClassifier::new(policy);
    // no carry between simulated turns: only the local pre-roll applies
    let prebuffer = RollingPrebuffer::new(0);
    let chunk = samples_for(sample_rate, policy.chunk_ms).max(1);
    let mut pointer = start;

    loop {
        let step = if pointer >= samples.len() {
            segmenter.on_eof()
        } else {
            let end = (pointer + chunk).min(samples.len());
            let frame = AudioFrame::new(samples[pointer..end].to_vec(), sample_rate, to_ms(pointer, sample_rate) as u64);
            pointer = end;
            let voiced = classifier.is_voiced(&frame.samples, sample_rate);
            segmenter.on_chunk(&frame, voiced, &prebuffer)
        };
        match step {
            Step::Continue => {}
            Step::Emit(reason) => {
                let buffered = segmenter.buffered_samples();
                let speech_samples = segmenter.speech_samples();
                let utterance = segmenter.take_utterance(reason, &prebuffer);
                let turn_start = pointer.saturating_sub(buffered);
                return Ok(CapturedTurn {
                    span: Span {
                        start: turn_start,
                        end: turn_start + utterance.samples.len(),
                    },
                    end_reason: reason,
                    speech_samples,
                    chunk_count: utterance.chunk_count,
                    samples: utterance.samples,
                    next_index: pointer,
                });
            }
            Step::Abort(_) => return Err(pointer),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TurnRecord {
    index: usize,
    start_ms: f64,
    end_ms: f64,
    duration_ms: f64,
    end_reason: EndReason,
    chunk_count: u32,
    speech_ms: f64,
    overlap_ratio: f64,
    start_clip_ms: f64,
    end_clip_ms: f64,
    warning: String,
    reference_index: Option<usize>,
    #[serde(skip)]
    end_sample: usize,
}

struct Evaluation {
    reference_index: Option<usize>,
    overlap_ratio: f64,
    start_clip_ms: f64,
    end_clip_ms: f64,
    warning: String,
}

fn evaluate_turn(
    turn: &CapturedTurn,
    previous: Option<&TurnRecord>,
    references: &[Span],
    sample_rate: u32,
    config: &ReferenceConfig,
) -> Evaluation {
    let best = references
        .iter()
        .enumerate()
        .map(|(index, span)| (index, span, turn.span.overlap(span)))
        .filter(|(_, _, overlap)| *overlap > 0)
        .max_by_key(|(_, _, overlap)| *overlap);
    let Some((index, reference, overlap)) = best else {
        return Evaluation {
            reference_index: None,
            overlap_ratio: 0.0,
            start_clip_ms: 0.0,
            end_clip_ms: 0.0,
            warning: "no_reference_overlap".to_string(),
        };
    };

    let overlap_ratio = overlap as f64 / reference.len().max(1) as f64;
    let start_clip_ms = to_ms(turn.span.start.saturating_sub(reference.start), sample_rate);
    let end_clip_ms = if turn.end_reason == EndReason::MaxTurn {
        0.0
    } else {
        to_ms(reference.end.saturating_sub(turn.span.end), sample_rate)
    };
    let continues_previous = previous.is_some_and(|prev| {
        prev.reference_index == Some(index)
            && prev.end_reason == EndReason::MaxTurn
            && turn.span.start.abs_diff(prev.end_sample) <= samples_for(sample_rate, CONTINUATION_WINDOW_MS)
    });

    let mut warnings = Vec::new();
    if !continues_previous && start_clip_ms > config.start_clip_warn_ms {
        warnings.push("start_clip");
    }
    if end_clip_ms > config.end_clip_warn_ms {
        warnings.push("end_clip");
    }
    if !continues_previous && overlap_ratio < 0.75 && turn.end_reason != EndReason::MaxTurn {
        warnings.push("low_overlap");
    }
    Evaluation {
        reference_index: Some(index),
        overlap_ratio,
        start_clip_ms: if continues_previous { 0.0 } else { start_clip_ms },
        end_clip_ms,
        warning: warnings.join(","),
    }
}

#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    sample_rate: u32,
    source_duration_sec: f64,
    reference_utterances: usize,
    captured_turns: usize,
    clipped_start: usize,
    clipped_end: usize,
    low_overlap: usize,
    end_reasons: BTreeMap<&'static str, usize>,
    turns: Vec<TurnRecord>,
}

#[derive(Debug, Serialize)]
struct Summary {
    generated_at: DateTime<Utc>,
    config: SimulationConfig,
    files: Vec<FileReport>,
}

fn simulate_file(path: &Path, turns_dir: &Path, config: &SimulationConfig, args: &Args) -> anyhow::Result<FileReport> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let decoded = wav::decode(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    let (samples, sample_rate) = (decoded.samples, decoded.sample_rate);
    let references = reference_utterances(&samples, sample_rate, &config.reference);
    let gap = samples_for(sample_rate, config.post_turn_gap_ms);
    let chunk = samples_for(sample_rate, config.segmenter.chunk_ms).max(1);
    let base = path.file_stem().and_then(|s| s.to_str()).unwrap_or("input");

    let mut turns: Vec<TurnRecord> = Vec::new();
    let mut index = 0usize;
    for _ in 0..args.max_turns {
        if index >= samples.len() {
            break;
        }
        let turn = match capture_turn(&samples, sample_rate, index, &config.segmenter) {
            Ok(turn) => turn,
            Err(next) => {
                index = if next <= index { index + chunk } else { next };
                continue;
            }
        };
        let eval = evaluate_turn(&turn, turns.last(), &references, sample_rate, &config.reference);
        let record = TurnRecord {
            index: turns.len(),
            start_ms: round1(to_ms(turn.span.start, sample_rate)),
            end_ms: round1(to_ms(turn.span.end, sample_rate)),
            duration_ms: round1(to_ms(turn.span.len(), sample_rate)),
            end_reason: turn.end_reason,
            chunk_count: turn.chunk_count,
            speech_ms: round1(to_ms(turn.speech_samples, sample_rate)),
            overlap_ratio: (eval.overlap_ratio * 1_000.0).round() / 1_000.0,
            start_clip_ms: round1(eval.start_clip_ms),
            end_clip_ms: round1(eval.end_clip_ms),
            warning: eval.warning,
            reference_index: eval.reference_index,
            end_sample: turn.span.end,
        };

        if !args.no_emit_turn_wavs {
            let name = format!("{base}-turn-{:03}-{}.wav", record.index, turn.end_reason.as_str());
            let bytes = wav::encode_mono(&turn.samples, sample_rate)?;
            fs::write(turns_dir.join(&name), bytes).with_context(|| format!("writing {name}"))?;
        }
        turns.push(record);
        index = turn.next_index + gap;
    }

    let mut end_reasons = BTreeMap::new();
    for turn in &turns {
        *end_reasons.entry(turn.end_reason.as_str()).or_insert(0) += 1;
    }
    Ok(FileReport {
        file: path.display().to_string(),
        sample_rate,
        source_duration_sec: to_ms(samples.len(), sample_rate).round() / 1_000.0,
        reference_utterances: references.len(),
        captured_turns: turns.len(),
        clipped_start: turns
            .iter()
            .filter(|t| t.start_clip_ms > config.reference.start_clip_warn_ms)
            .count(),
        clipped_end: turns.iter().filter(|t| t.end_clip_ms > config.reference.end_clip_warn_ms).count(),
        low_overlap: turns.iter().filter(|t| t.warning.contains("low_overlap")).count(),
        end_reasons,
        turns,
    })
}

fn resolve_inputs(entries: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in entries {
        if entry.is_dir() {
            for dirent in fs::read_dir(entry).with_context(|| format!("listing {}", entry.display()))? {
                let path = dirent?.path();
                let is_wav = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
                if path.is_file() && is_wav {
                    files.insert(path);
                }
            }
        } else if entry.is_file() {
            files.insert(entry.clone());
        } else {
            bail!("input not found: {}", entry.display());
        }
    }
    if files.is_empty() {
        bail!("no WAV files found in the inputs");
    }
    Ok(files.into_iter().collect())
}

fn render_report(summary: &Summary) -> anyhow::Result<String> {
    let mut lines = vec![
        "# Stream Capture Simulation Report".to_string(),
        String::new(),
        "## Config".to_string(),
        String::new(),
        "```json".to_string(),
        serde_json::to_string_pretty(&summary.config)?,
        "```".to_string(),
        String::new(),
    ];
    for file in &summary.files {
        let name = Path::new(&file.file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.file.clone());
        lines.push(format!("## {name}"));
        lines.push(String::new());
        lines.push(format!("- source_duration_sec: {}", file.source_duration_sec));
        lines.push(format!("- reference_utterances: {}", file.reference_utterances));
        lines.push(format!("- captured_turns: {}", file.captured_turns));
        lines.push(format!("- clipped_start: {}", file.clipped_start));
        lines.push(format!("- clipped_end: {}", file.clipped_end));
        lines.push(format!("- low_overlap: {}", file.low_overlap));
        lines.push(format!("- end_reasons: {}", serde_json::to_string(&file.end_reasons)?));
        lines.push(String::new());
        lines.push("| turn | startMs | endMs | durMs | reason | overlap | startClip | endClip | warning |".to_string());
        lines.push("|---:|---:|---:|---:|---|---:|---:|---:|---|".to_string());
        for turn in file.turns.iter().take(REPORT_TURN_LIMIT) {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
                turn.index,
                turn.start_ms,
                turn.end_ms,
                turn.duration_ms,
                turn.end_reason.as_str(),
                turn.overlap_ratio,
                turn.start_clip_ms,
                turn.end_clip_ms,
                turn.warning
            ));
        }
        if file.turns.len() > REPORT_TURN_LIMIT {
            lines.push(format!(
                "| ... | ... | ... | ... | ... | ... | ... | ... | {} more turns |",
                file.turns.len() - REPORT_TURN_LIMIT
            ));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut segmenter = TurnPolicy::stream_simulation().segmenter;
    let overrides = [
        (args.chunk_ms, &mut segmenter.chunk_ms),
        (args.pre_roll_ms, &mut segmenter.pre_roll_ms),
        (args.min_speech_ms, &mut segmenter.min_speech_ms),
        (args.silence_ms, &mut segmenter.silence_ms),
        (args.max_turn_ms, &mut segmenter.max_turn_ms),
        (args.loop_timeout_ms, &mut segmenter.loop_timeout_ms),
    ];
    for (value, field) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    if segmenter.chunk_ms == 0 {
        bail!("--chunk-ms must be positive");
    }
    let config = SimulationConfig {
        segmenter,
        post_turn_gap_ms: args.post_turn_gap_ms,
        reference: ReferenceConfig::default(),
    };

    let outdir = match &args.outdir {
        Some(dir) => dir.clone(),
        None => PathBuf::from("debug-wavs").join(format!("stream-sim-{}", Utc::now().format("%Y-%m-%dT%H-%M-%S"))),
    };
    let turns_dir = outdir.join("turns");
    fs::create_dir_all(&turns_dir).with_context(|| format!("creating {}", turns_dir.display()))?;

    let mut files = Vec::new();
    for path in resolve_inputs(&args.inputs)? {
        match simulate_file(&path, &turns_dir, &config, &args) {
            Ok(report) => {
                info!(
                    file = %path.display(),
                    turns = report.captured_turns,
                    refs = report.reference_utterances,
                    start_clip = report.clipped_start,
                    end_clip = report.clipped_end,
                    low_overlap = report.low_overlap,
                    "simulated"
                );
                files.push(report);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "simulation failed"),
        }
    }

    let summary = Summary {
        generated_at: Utc::now(),
        config,
        files,
    };
    fs::write(outdir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
    fs::write(outdir.join("report.md"), render_report(&summary)?)?;
    println!("Simulation complete: {}", outdir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(ms: u32, amplitude: i16) -> Vec<i16> {
        (0..samples_for(16_000, ms))
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn recording() -> Vec<i16> {
        let mut samples = tone(1_000, 0);
        samples.extend(tone(1_500, 600));
        samples.extend(tone(1_500, 0));
        samples
    }

    #[test]
    fn reference_detector_finds_the_speech_span() {
        let spans = reference_utterances(&recording(), 16_000, &ReferenceConfig::default());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 16_000);
        assert_eq!(spans[0].end, 40_000);
    }

    #[test]
    fn simulated_turn_covers_the_reference() {
        let samples = recording();
        let policy = TurnPolicy::stream_simulation().segmenter;
        let turn = capture_turn(&samples, 16_000, 0, &policy).ok().unwrap();
        assert_eq!(turn.end_reason, EndReason::Silence);
        let references = reference_utterances(&samples, 16_000, &ReferenceConfig::default());
        let eval = evaluate_turn(&turn, None, &references, 16_000, &ReferenceConfig::default());
        assert_eq!(eval.reference_index, Some(0));
        assert!(eval.overlap_ratio > 0.99);
        assert_eq!(eval.start_clip_ms, 0.0);
        assert!(eval.warning.is_empty(), "warning: {}", eval.warning);
    }
}
