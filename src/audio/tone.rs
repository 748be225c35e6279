use std::f64::consts::TAU;

use super::wav::{self, WavError};
use crate::config::ReadyCuePolicy;

/// Sine tone with a linear attack and release, as mono 16-bit samples.
pub fn synthesize(policy: &ReadyCuePolicy) -> Vec<i16> {
    let rate = policy.sample_rate.max(1) as f64;
    let total = (rate * policy.duration_ms as f64 / 1_000.0) as usize;
    let attack = (rate * policy.attack_ms as f64 / 1_000.0) as usize;
    let release = (rate * policy.release_ms as f64 / 1_000.0) as usize;
    let peak = policy.amplitude.clamp(0.0, 1.0) * i16::MAX as f64;

    (0..total)
        .map(|n| {
            let mut gain = 1.0;
            if attack > 0 && n < attack {
                gain = n as f64 / attack as f64;
            }
            let remaining = total - n;
            if release > 0 && remaining <= release {
                gain = gain.min(remaining as f64 / release as f64);
            }
            let phase = TAU * policy.frequency_hz * n as f64 / rate;
            (phase.sin() * peak * gain).round() as i16
        })
        .collect()
}

pub fn ready_cue_wav(policy: &ReadyCuePolicy) -> Result<Vec<u8>, WavError> {
    wav::encode_mono(&synthesize(policy), policy.sample_rate)
}
