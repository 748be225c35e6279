use webrtc_vad::{SampleRate, Vad, VadMode};

use super::analysis::rms;
use super::resample;
use crate::config::SegmenterPolicy;

const VAD_SAMPLE_RATE: u32 = 16_000;
// 20ms at 16kHz
const VAD_FRAME_SAMPLES: usize = 320;

/// Decides whether one capture chunk holds speech.
///
/// Without the WebRTC detector this is a plain RMS test. With it, a chunk is
/// voiced when it is loud enough on its own, or when enough of its 20ms
/// sub-frames are classified as speech.
///
/// `Vad` is not `Send`, so a classifier lives on the thread that captures.
pub struct ChunkClassifier {
    vad: Option<Vad>,
    vad_rms: f64,
    vad_rms_fallback: f64,
    min_speech_frame_ratio: f64,
}

impl ChunkClassifier {
    pub fn new(policy: &SegmenterPolicy) -> Self {
        let vad = policy
            .use_webrtc_vad
            .then(|| Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, VadMode::Aggressive));
        Self {
            vad,
            vad_rms: policy.vad_rms,
            vad_rms_fallback: policy.vad_rms_fallback,
            min_speech_frame_ratio: policy.vad_min_speech_frame_ratio,
        }
    }

    pub fn uses_webrtc(&self) -> bool {
        self.vad.is_some()
    }

    pub fn is_voiced(&mut self, samples: &[i16], sample_rate: u32) -> bool {
        let level = rms(samples);
        let Some(vad) = self.vad.as_mut() else {
            return level >= self.vad_rms;
        };
        if level >= self.vad_rms_fallback {
            return true;
        }
        let pcm = resample::linear(samples, sample_rate, VAD_SAMPLE_RATE);
        let mut frames = 0usize;
        let mut speech = 0usize;
        for frame in pcm.chunks_exact(VAD_FRAME_SAMPLES) {
            frames += 1;
            if matches!(vad.is_voice_segment(frame), Ok(true)) {
                speech += 1;
            }
        }
        frames > 0 && speech as f64 / frames as f64 >= self.min_speech_frame_ratio
    }
}
