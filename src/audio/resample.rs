use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use thiserror::Error;

use crate::devices::PlaybackTarget;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("failed to build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
    #[error("invalid sample rate {0}")]
    InvalidRate(u32),
}

/// Linear interpolation. Cheap enough for per-chunk capture work.
pub fn linear(samples: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if input_rate == output_rate || samples.is_empty() || input_rate == 0 || output_rate == 0 {
        return samples.to_vec();
    }
    let ratio = output_rate as f64 / input_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round() as usize;
    let last = samples[samples.len() - 1];
    (0..output_len)
        .map(|n| {
            let position = n as f64 / ratio;
            let base = position.floor() as usize;
            let frac = position - base as f64;
            let a = samples.get(base).copied().unwrap_or(last) as f64;
            let b = samples.get(base + 1).copied().unwrap_or(last) as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Band-limited sinc resampling over a whole buffer, for audio that will be heard.
pub fn sinc(samples: &[i16], input_rate: f64, output_rate: f64) -> Result<Vec<i16>, ResampleError> {
    if (input_rate - output_rate).abs() < 1.0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(output_rate / input_rate, 2.0, params, samples.len(), 1)?;
    let input = vec![samples.iter().map(|&s| s as f32 / 32_768.0).collect::<Vec<f32>>()];
    let output = resampler.process(&input, None)?;
    Ok(output
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|v| (v.clamp(-1.0, 1.0) * 32_767.0) as i16)
        .collect())
}

/// PCM laid out for one playback target.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAudio {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Wall-clock time the target needs to drain `pcm`.
    pub duration_ms: u64,
}

/// Resamples mono audio to the target rate (stretched by its speed compensation)
/// and fans it out to the target's channel count.
pub fn prepare_for_playback(
    samples: &[i16],
    source_rate: u32,
    target: &PlaybackTarget,
) -> Result<PreparedAudio, ResampleError> {
    if source_rate == 0 {
        return Err(ResampleError::InvalidRate(source_rate));
    }
    if target.sample_rate == 0 {
        return Err(ResampleError::InvalidRate(target.sample_rate));
    }
    let effective_rate = target.sample_rate as f64 * target.speed_compensation.max(0.1);
    let mono = sinc(samples, source_rate as f64, effective_rate)?;
    let channels = target.channels.max(1);
    let mut pcm = Vec::with_capacity(mono.len() * channels as usize);
    for sample in &mono {
        for _ in 0..channels {
            pcm.push(*sample);
        }
    }
    let duration_ms = mono.len() as u64 * 1_000 / target.sample_rate as u64;
    Ok(PreparedAudio {
        pcm,
        sample_rate: target.sample_rate,
        channels,
        duration_ms,
    })
}
