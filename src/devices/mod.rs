//! Collaborators the engine drives but does not implement: call state, capture,
//! playback and audio routing. Real deployments plug hardware in here; the
//! file-backed and timed implementations serve the binaries and tests.
pub mod call_state;
pub mod timed_playback;
pub mod wav_file;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device busy: {0}")]
    Busy(String),
    #[error("unknown device: {0}")]
    Unknown(String),
    #[error("device i/o failed: {0}")]
    Io(String),
    #[error("device operation timed out")]
    Timeout,
}

/// Mono 16-bit PCM as delivered by a capture read.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub captured_at_ms: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, captured_at_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1_000 / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEndpoint {
    pub id: String,
    pub display_name: String,
    /// Empty means "no hint": any configured rate may be tried.
    #[serde(default)]
    pub sample_rates: Vec<u32>,
    #[serde(default)]
    pub channel_counts: Vec<u16>,
}

impl CaptureEndpoint {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            sample_rates: Vec::new(),
            channel_counts: Vec::new(),
        }
    }

    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.is_empty() || self.sample_rates.contains(&rate)
    }

    pub fn supports_channels(&self, channels: u16) -> bool {
        self.channel_counts.is_empty() || self.channel_counts.contains(&channels)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackTarget {
    pub id: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Some output paths drain faster than real time; audio is stretched by this factor.
    #[serde(default = "unity")]
    pub speed_compensation: f64,
}

fn unity() -> f64 {
    1.0
}

impl PlaybackTarget {
    pub fn new(id: impl Into<String>, sample_rate: u32, channels: u16, speed_compensation: f64) -> Self {
        Self {
            id: id.into(),
            sample_rate,
            channels,
            speed_compensation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(pub u64);

pub trait CallStateProvider: Send + Sync {
    fn is_call_active(&self) -> bool;
    fn hang_up(&self) -> Result<(), DeviceError>;
}

pub trait CaptureProvider: Send + Sync {
    /// Blocks for roughly `duration_ms` and returns mono PCM, or `None` when the
    /// source produced nothing.
    fn read_chunk(
        &self,
        endpoint_id: &str,
        duration_ms: u32,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Option<AudioFrame>, DeviceError>;

    /// Drops and reopens any stream held for `endpoint_id`.
    fn restart_stream(&self, _endpoint_id: &str) {}
}

pub trait PlaybackDevice: Send + Sync {
    fn write(
        &self,
        pcm: &[i16],
        target: &PlaybackTarget,
        sample_rate: u32,
        channels: u16,
    ) -> Result<PlaybackHandle, DeviceError>;
    fn is_alive(&self, handle: PlaybackHandle) -> bool;
    fn stop(&self, handle: PlaybackHandle);
}

pub trait RouteController: Send + Sync {
    fn reapply(&self) -> Result<(), DeviceError>;
}
