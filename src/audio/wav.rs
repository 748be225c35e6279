use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("invalid wav container: {0}")]
    Container(#[from] hound::Error),
    #[error("unsupported wav layout: {bits} bit {format:?}")]
    Unsupported { bits: u16, format: SampleFormat },
    #[error("wav has no channels")]
    NoChannels,
}

/// Canonical internal audio: mono 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWav {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Channel count of the source before downmixing.
    pub source_channels: u16,
}

impl DecodedWav {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1_000 / self.sample_rate as u64
    }
}

/// Decodes any PCM or float WAV and downmixes it to mono 16-bit.
pub fn decode(bytes: &[u8]) -> Result<DecodedWav, WavError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(WavError::NoChannels);
    }

    let widened: Vec<i32> = match (spec.sample_format, spec.bits_per_sample) {
        // hound already re-centres unsigned 8-bit samples around zero
        (SampleFormat::Int, 8) => collect_int(&mut reader, |v| v << 8)?,
        (SampleFormat::Int, 16) => collect_int(&mut reader, |v| v)?,
        (SampleFormat::Int, 24) => collect_int(&mut reader, |v| v >> 8)?,
        (SampleFormat::Int, 32) => collect_int(&mut reader, |v| v >> 16)?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32_767.0) as i32))
            .collect::<Result<_, _>>()?,
        (format, bits) => return Err(WavError::Unsupported { bits, format }),
    };

    let channels = spec.channels as usize;
    let samples = widened
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().sum();
            (sum / channels as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect();

    Ok(DecodedWav {
        samples,
        sample_rate: spec.sample_rate,
        source_channels: spec.channels,
    })
}

fn collect_int<R: std::io::Read>(
    reader: &mut WavReader<R>,
    widen: impl Fn(i32) -> i32,
) -> Result<Vec<i32>, hound::Error> {
    reader.samples::<i32>().map(|s| s.map(&widen)).collect()
}

/// Encodes mono 16-bit PCM as a WAV byte buffer.
pub fn encode_mono(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, WavError> {
    encode_interleaved(samples, sample_rate, 1)
}

pub fn encode_interleaved(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, WavError> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Playable duration of a WAV buffer without decoding its samples.
pub fn duration_ms(bytes: &[u8]) -> Result<u64, WavError> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0);
    }
    Ok(reader.duration() as u64 * 1_000 / spec.sample_rate as u64)
}
