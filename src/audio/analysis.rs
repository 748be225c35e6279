use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{AnalysisPolicy, SpeakerPolicy};

const MIN_FRAME_SAMPLES: usize = 80;
const NOISE_FLOOR_PERCENTILE: f64 = 0.20;
const PEAK_PERCENTILE: f64 = 0.90;
const MAX_TILT: f64 = 3.0;

/// Four bounded scalars describing how a talker sounds over the voiced frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerFingerprint {
    /// Mean voiced-frame RMS over full scale, in [0, 1].
    pub voiced_rms: f64,
    /// Spread of voiced-frame RMS over full scale, in [0, 1].
    pub voiced_rms_std: f64,
    /// Mean zero crossings per sample, in [0, 1].
    pub zcr: f64,
    /// Mean ratio of difference energy to signal energy, in [0, 3].
    pub tilt: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureAnalysis {
    pub overall_rms: f64,
    pub voiced_ms: u32,
    pub voiced_ratio: f64,
    pub dynamic_range: f64,
    pub clipping_ratio: f64,
    pub confidence: f64,
    pub fingerprint: SpeakerFingerprint,
}

/// Why a captured buffer is not worth transcribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRejection {
    LowRms,
    ShortVoice,
    LowVoicedRatio,
    FlatSignal,
    Clipping,
    LowConfidence,
    SpeakerMismatch,
}

impl QualityRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowRms => "low_rms",
            Self::ShortVoice => "short_voice",
            Self::LowVoicedRatio => "low_voiced_ratio",
            Self::FlatSignal => "flat_signal",
            Self::Clipping => "clipping",
            Self::LowConfidence => "low_confidence",
            Self::SpeakerMismatch => "speaker_mismatch",
        }
    }
}

impl fmt::Display for QualityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

pub fn frame_len(sample_rate: u32, frame_ms: u32) -> usize {
    ((sample_rate as u64 * frame_ms as u64 / 1_000) as usize).max(MIN_FRAME_SAMPLES)
}

/// RMS of each complete frame; a trailing partial frame is dropped.
pub fn frame_rms(samples: &[i16], sample_rate: u32, frame_ms: u32) -> Vec<f64> {
    samples.chunks_exact(frame_len(sample_rate, frame_ms)).map(rms).collect()
}

/// Nearest-rank percentile with the index truncated toward zero.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)) as usize;
    sorted[position]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (sum / values.len() as f64).sqrt()
}

struct FrameStats {
    rms: f64,
    zcr: f64,
    tilt: f64,
}

/// Splits `samples` into fixed frames and derives loudness, voicing, range,
/// clipping, a blended confidence and a speaker fingerprint.
///
/// A buffer shorter than one frame only reports its overall RMS.
pub fn analyze(samples: &[i16], sample_rate: u32, policy: &AnalysisPolicy) -> CaptureAnalysis {
    let overall_rms = rms(samples);
    let frame_samples = frame_len(sample_rate, policy.frame_ms);
    if samples.len() < frame_samples {
        return CaptureAnalysis {
            overall_rms,
            ..CaptureAnalysis::default()
        };
    }

    let clip = policy.clip_threshold.unsigned_abs() as i32;
    let mut frames = Vec::with_capacity(samples.len() / frame_samples);
    let mut clipped = 0usize;
    for frame in samples.chunks_exact(frame_samples) {
        let mut sum = 0.0;
        let mut diff_sum = 0.0;
        let mut crossings = 0usize;
        let mut previous = frame[0] as i32;
        for &sample in frame {
            let current = sample as i32;
            sum += (current as f64) * (current as f64);
            let diff = (current - previous) as f64;
            diff_sum += diff * diff;
            if (current >= 0) != (previous >= 0) {
                crossings += 1;
            }
            if current.abs() >= clip {
                clipped += 1;
            }
            previous = current;
        }
        let tilt = if sum <= 1.0 { 0.0 } else { (diff_sum / sum).clamp(0.0, MAX_TILT) };
        frames.push(FrameStats {
            rms: (sum / frame_samples as f64).sqrt(),
            zcr: crossings as f64 / frame_samples as f64,
            tilt,
        });
    }

    let mut sorted: Vec<f64> = frames.iter().map(|f| f.rms).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let noise_floor = percentile(&sorted, NOISE_FLOOR_PERCENTILE);
    let voice_threshold = policy.min_vad_rms.max(noise_floor * policy.vad_noise_multiplier);

    let voiced: Vec<&FrameStats> = frames.iter().filter(|f| f.rms >= voice_threshold).collect();
    let voiced_ms = voiced.len() as u32 * policy.frame_ms;
    let voiced_ratio = voiced.len() as f64 / frames.len() as f64;
    let dynamic_range = percentile(&sorted, PEAK_PERCENTILE) - noise_floor;
    let clipping_ratio = clipped as f64 / samples.len() as f64;

    let voiced_rms: Vec<f64> = voiced.iter().map(|f| f.rms).collect();
    let voiced_rms_mean = mean(&voiced_rms);
    let voiced_rms_std = std_dev(&voiced_rms, voiced_rms_mean);
    let zcr_mean = mean(&voiced.iter().map(|f| f.zcr).collect::<Vec<_>>());
    let tilt_mean = mean(&voiced.iter().map(|f| f.tilt).collect::<Vec<_>>());

    let energy_score = ((overall_rms - policy.min_capture_rms) / 100.0).clamp(0.0, 1.0);
    let voiced_score = ((voiced_ms as f64 - policy.min_voiced_ms as f64) / 1_200.0).clamp(0.0, 1.0);
    let range_score = (dynamic_range / 18.0).clamp(0.0, 1.0);
    let clip_penalty = if policy.max_clipping_ratio > 0.0 {
        1.0 - (clipping_ratio / policy.max_clipping_ratio).clamp(0.0, 1.0)
    } else if clipping_ratio > 0.0 {
        0.0
    } else {
        1.0
    };
    let confidence =
        (0.35 * energy_score + 0.30 * voiced_score + 0.20 * range_score + 0.15 * clip_penalty).clamp(0.0, 1.0);

    CaptureAnalysis {
        overall_rms,
        voiced_ms,
        voiced_ratio,
        dynamic_range,
        clipping_ratio,
        confidence,
        fingerprint: SpeakerFingerprint {
            voiced_rms: (voiced_rms_mean / 32_768.0).clamp(0.0, 1.0),
            voiced_rms_std: (voiced_rms_std / 32_768.0).clamp(0.0, 1.0),
            zcr: zcr_mean.clamp(0.0, 1.0),
            tilt: tilt_mean.clamp(0.0, MAX_TILT),
        },
    }
}

/// First failing check in a fixed order, or `None` when the capture is usable.
pub fn evaluate_quality(analysis: &CaptureAnalysis, policy: &AnalysisPolicy) -> Option<QualityRejection> {
    if analysis.overall_rms < policy.min_capture_rms {
        return Some(QualityRejection::LowRms);
    }
    if analysis.voiced_ms < policy.min_voiced_ms {
        return Some(QualityRejection::ShortVoice);
    }
    if analysis.voiced_ratio < policy.min_voiced_ratio {
        return Some(QualityRejection::LowVoicedRatio);
    }
    if analysis.dynamic_range < policy.min_dynamic_range {
        return Some(QualityRejection::FlatSignal);
    }
    if analysis.clipping_ratio > policy.max_clipping_ratio {
        return Some(QualityRejection::Clipping);
    }
    if analysis.confidence < policy.min_capture_confidence {
        return Some(QualityRejection::LowConfidence);
    }
    None
}

/// Similarity in [0, 1]; 1 means the fingerprints are indistinguishable.
pub fn speaker_similarity(baseline: &SpeakerFingerprint, sample: &SpeakerFingerprint) -> f64 {
    let rms_diff = ((baseline.voiced_rms - sample.voiced_rms).abs() / 0.15).clamp(0.0, 1.0);
    let std_diff = ((baseline.voiced_rms_std - sample.voiced_rms_std).abs() / 0.10).clamp(0.0, 1.0);
    let zcr_diff = ((baseline.zcr - sample.zcr).abs() / 0.20).clamp(0.0, 1.0);
    let tilt_diff = ((baseline.tilt - sample.tilt).abs() / 1.10).clamp(0.0, 1.0);
    let distance = 0.35 * rms_diff + 0.20 * std_diff + 0.25 * zcr_diff + 0.20 * tilt_diff;
    (1.0 - distance).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeakerCheck {
    Disabled,
    NotEnrolled,
    Match(f64),
    Mismatch(f64),
}

/// The caller's enrolled voice for one call. Enrollment happens once and sticks.
#[derive(Debug, Clone, Default)]
pub struct SpeakerProfile {
    policy: SpeakerPolicy,
    enrolled: Option<SpeakerFingerprint>,
}

impl SpeakerProfile {
    pub fn new(policy: SpeakerPolicy) -> Self {
        Self { policy, enrolled: None }
    }

    pub fn enrolled(&self) -> Option<&SpeakerFingerprint> {
        self.enrolled.as_ref()
    }

    /// Enrolls from `analysis` if verification is on, nobody is enrolled yet and
    /// enough voiced audio was heard. Returns whether enrollment happened.
    pub fn observe(&mut self, analysis: &CaptureAnalysis) -> bool {
        if !self.policy.verification_enabled || self.enrolled.is_some() {
            return false;
        }
        if analysis.voiced_ms < self.policy.min_enroll_voiced_ms {
            return false;
        }
        self.enrolled = Some(analysis.fingerprint);
        true
    }

    pub fn verify(&self, analysis: &CaptureAnalysis) -> SpeakerCheck {
        if !self.policy.verification_enabled {
            return SpeakerCheck::Disabled;
        }
        let Some(baseline) = self.enrolled.as_ref() else {
            return SpeakerCheck::NotEnrolled;
        };
        let similarity = speaker_similarity(baseline, &analysis.fingerprint);
        if similarity >= self.policy.min_similarity {
            SpeakerCheck::Match(similarity)
        } else {
            SpeakerCheck::Mismatch(similarity)
        }
    }

    pub fn reset(&mut self) {
        self.enrolled = None;
    }
}
