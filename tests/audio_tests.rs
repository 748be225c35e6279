mod common;

use common::{silence, speech_like, RATE};
use parley::audio::analysis::{self, QualityRejection, SpeakerCheck, SpeakerProfile};
use parley::audio::resample::{self, ResampleError};
use parley::audio::vad::ChunkClassifier;
use parley::audio::{tone, wav};
use parley::config::{AnalysisPolicy, ReadyCuePolicy, SegmenterPolicy, SpeakerPolicy};
use parley::devices::PlaybackTarget;

/// Square wave with a slow period: few zero crossings and a dull spectrum.
fn low_hum(amplitude: i16, ms: u32) -> Vec<i16> {
    const ENVELOPE: [f64; 4] = [1.0, 0.5, 0.8, 0.3];
    let total = (RATE * ms / 1_000) as usize;
    (0..total)
        .map(|n| {
            let level = (amplitude as f64 * ENVELOPE[(n / 320) % 4]) as i16;
            if (n / 20) % 2 == 0 {
                level
            } else {
                -level
            }
        })
        .collect()
}

#[test]
fn test_speech_passes_quality_checks() {
    let policy = AnalysisPolicy::default();
    let result = analysis::analyze(&speech_like(3_000, 2_000, RATE), RATE, &policy);

    assert_eq!(result.voiced_ms, 1_500, "three of four envelope steps are voiced");
    assert!((result.voiced_ratio - 0.75).abs() < 1e-9);
    assert_eq!(result.dynamic_range, 2_100.0);
    assert_eq!(result.clipping_ratio, 0.0);
    assert!(result.confidence > 0.9, "confidence {}", result.confidence);
    assert_eq!(analysis::evaluate_quality(&result, &policy), None);
}

#[test]
fn test_quality_rejections() {
    let policy = AnalysisPolicy::default();

    // 1. Digital silence
    let quiet = analysis::analyze(&silence(2_000, RATE), RATE, &policy);
    assert_eq!(analysis::evaluate_quality(&quiet, &policy), Some(QualityRejection::LowRms));

    // 2. A short burst in a long silence
    let mut burst = speech_like(3_000, 300, RATE);
    burst.extend(silence(1_700, RATE));
    let burst = analysis::analyze(&burst, RATE, &policy);
    assert_eq!(burst.voiced_ms, 300);
    assert_eq!(analysis::evaluate_quality(&burst, &policy), Some(QualityRejection::ShortVoice));

    // 3. Audio pinned at full scale
    let clipped = analysis::analyze(&speech_like(i16::MAX, 2_000, RATE), RATE, &policy);
    assert!(clipped.clipping_ratio > 0.2);
    assert_eq!(analysis::evaluate_quality(&clipped, &policy), Some(QualityRejection::Clipping));
}

#[test]
fn test_buffer_shorter_than_a_frame_reports_only_rms() {
    let policy = AnalysisPolicy::default();
    let result = analysis::analyze(&[1_000, -1_000, 1_000, -1_000], RATE, &policy);
    assert_eq!(result.overall_rms, 1_000.0);
    assert_eq!(result.voiced_ms, 0);
    assert_eq!(result.confidence, 0.0);
}

#[test]
fn test_speaker_profile_enrolls_once_and_verifies() {
    // 1. Disabled by default
    let analysis_policy = AnalysisPolicy::default();
    let caller = analysis::analyze(&speech_like(3_000, 2_000, RATE), RATE, &analysis_policy);
    let mut off = SpeakerProfile::new(SpeakerPolicy::default());
    assert!(!off.observe(&caller));
    assert_eq!(off.verify(&caller), SpeakerCheck::Disabled);

    // 2. Enabled: nothing to compare against until enrollment
    let mut profile = SpeakerProfile::new(SpeakerPolicy {
        verification_enabled: true,
        ..SpeakerPolicy::default()
    });
    assert_eq!(profile.verify(&caller), SpeakerCheck::NotEnrolled);
    assert!(profile.observe(&caller));
    assert!(!profile.observe(&caller), "enrollment sticks");

    // 3. Same voice matches, a very different one does not
    assert_eq!(profile.verify(&caller), SpeakerCheck::Match(1.0));
    let stranger = analysis::analyze(&low_hum(12_000, 2_000), RATE, &analysis_policy);
    assert!(matches!(profile.verify(&stranger), SpeakerCheck::Mismatch(s) if s < 0.52));

    // 4. Reset forgets the caller
    profile.reset();
    assert!(profile.enrolled().is_none());
}

#[test]
fn test_enrollment_needs_enough_voice() {
    let mut profile = SpeakerProfile::new(SpeakerPolicy {
        verification_enabled: true,
        ..SpeakerPolicy::default()
    });
    let short = analysis::analyze(&speech_like(3_000, 800, RATE), RATE, &AnalysisPolicy::default());
    assert!(!profile.observe(&short));
    assert!(profile.enrolled().is_none());
}

#[test]
fn test_wav_decode_downmixes_stereo() {
    let bytes = wav::encode_interleaved(&[1_000, 3_000, -1_000, -3_000], 8_000, 2).expect("encode");
    let decoded = wav::decode(&bytes).expect("decode");
    assert_eq!(decoded.samples, vec![2_000, -2_000]);
    assert_eq!(decoded.sample_rate, 8_000);
    assert_eq!(decoded.source_channels, 2);
}

#[test]
fn test_wav_duration_and_bad_input() {
    let bytes = wav::encode_mono(&silence(1_000, RATE), RATE).expect("encode");
    assert_eq!(wav::duration_ms(&bytes).expect("duration"), 1_000);
    assert_eq!(wav::decode(&bytes).expect("decode").duration_ms(), 1_000);

    assert!(matches!(wav::decode(b"not a wav file"), Err(wav::WavError::Container(_))));
}

#[test]
fn test_resamplers_scale_length() {
    let input = speech_like(2_000, 100, 48_000);
    assert_eq!(input.len(), 4_800);

    assert_eq!(resample::linear(&input, 48_000, 16_000).len(), 1_600);

    let sinc = resample::sinc(&input, 48_000.0, 16_000.0).expect("sinc");
    assert!((1_580..=1_620).contains(&sinc.len()), "sinc produced {} samples", sinc.len());
}

#[test]
fn test_playback_preparation_applies_speed_and_channels() {
    // 1. One second of mono speech for a fast-draining stereo 48 kHz target
    let samples = speech_like(2_000, 1_000, RATE);
    let target = PlaybackTarget::new("spk", 48_000, 2, 1.5);

    // 2. Stretched by 1.5 and duplicated per channel
    let prepared = resample::prepare_for_playback(&samples, RATE, &target).expect("prepare");
    assert_eq!(prepared.sample_rate, 48_000);
    assert_eq!(prepared.channels, 2);
    assert!(
        (1_480..=1_520).contains(&prepared.duration_ms),
        "duration {}",
        prepared.duration_ms
    );
    assert_eq!(prepared.pcm.len() % 2, 0);
    assert_eq!(prepared.pcm[100], prepared.pcm[101], "channels carry the same sample");

    // 3. A zero source rate is refused
    assert!(matches!(
        resample::prepare_for_playback(&samples, 0, &target),
        Err(ResampleError::InvalidRate(0))
    ));
}

#[test]
fn test_ready_cue_shape() {
    let policy = ReadyCuePolicy::default();
    let tone = tone::synthesize(&policy);

    assert_eq!(tone.len(), 1_520);
    assert_eq!(tone[0], 0, "attack starts from silence");
    let peak = tone.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    let ceiling = (policy.amplitude * i16::MAX as f64).round() as u16;
    assert!(peak <= ceiling && peak > ceiling / 2, "peak {peak}");

    let bytes = tone::ready_cue_wav(&policy).expect("cue wav");
    assert_eq!(wav::duration_ms(&bytes).expect("duration"), 95);
}

#[test]
fn test_chunk_classifier_without_webrtc_is_an_energy_gate() {
    let mut classifier = ChunkClassifier::new(&SegmenterPolicy {
        use_webrtc_vad: false,
        ..SegmenterPolicy::default()
    });
    assert!(!classifier.uses_webrtc());
    assert!(classifier.is_voiced(&speech_like(2_000, 120, RATE), RATE));
    assert!(!classifier.is_voiced(&speech_like(40, 120, RATE), RATE));
}

#[test]
fn test_chunk_classifier_loud_chunks_skip_webrtc() {
    let mut classifier = ChunkClassifier::new(&SegmenterPolicy::default());
    assert!(classifier.uses_webrtc());
    assert!(classifier.is_voiced(&speech_like(2_000, 120, 48_000), 48_000));
    assert!(!classifier.is_voiced(&silence(120, 48_000), 48_000));
}
