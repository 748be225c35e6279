use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::{DeviceError, PlaybackDevice, PlaybackHandle, PlaybackTarget};

/// One accepted write, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRecord {
    pub handle: PlaybackHandle,
    pub target: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
}

struct ActivePlayback {
    ends_at: Instant,
    stopped: bool,
}

/// Playback that "plays" for exactly as long as the audio lasts and then
/// reports itself finished. Stands in for a real output path in the
/// binaries and tests.
pub struct TimedPlayback {
    next: AtomicU64,
    active: Mutex<HashMap<PlaybackHandle, ActivePlayback>>,
    records: Mutex<Vec<PlaybackRecord>>,
    failing: HashSet<String>,
    /// Never reports completion on its own, like a driver that forgets to signal.
    stuck: bool,
}

impl TimedPlayback {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            stuck: false,
        }
    }

    pub fn with_failing_target(mut self, id: impl Into<String>) -> Self {
        self.failing.insert(id.into());
        self
    }

    pub fn stuck(mut self) -> Self {
        self.stuck = true;
        self
    }

    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.records.lock().clone()
    }

    pub fn was_stopped(&self, handle: PlaybackHandle) -> bool {
        self.active.lock().get(&handle).is_some_and(|p| p.stopped)
    }
}

impl Default for TimedPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackDevice for TimedPlayback {
    fn write(
        &self,
        pcm: &[i16],
        target: &PlaybackTarget,
        sample_rate: u32,
        channels: u16,
    ) -> Result<PlaybackHandle, DeviceError> {
        if self.failing.contains(&target.id) {
            return Err(DeviceError::Busy(target.id.clone()));
        }
        if sample_rate == 0 || channels == 0 {
            return Err(DeviceError::Io(format!("bad format {sample_rate} Hz x{channels}")));
        }
        let frames = pcm.len() / channels as usize;
        let duration = Duration::from_millis(frames as u64 * 1_000 / sample_rate as u64);
        let handle = PlaybackHandle(self.next.fetch_add(1, Ordering::SeqCst));
        debug!(target = %target.id, frames, ?duration, "timed playback started");
        self.active.lock().insert(
            handle,
            ActivePlayback {
                ends_at: Instant::now() + duration,
                stopped: false,
            },
        );
        self.records.lock().push(PlaybackRecord {
            handle,
            target: target.id.clone(),
            sample_rate,
            channels,
            frames,
        });
        Ok(handle)
    }

    fn is_alive(&self, handle: PlaybackHandle) -> bool {
        match self.active.lock().get(&handle) {
            Some(p) if p.stopped => false,
            Some(_) if self.stuck => true,
            Some(p) => Instant::now() < p.ends_at,
            None => false,
        }
    }

    fn stop(&self, handle: PlaybackHandle) {
        if let Some(p) = self.active.lock().get_mut(&handle) {
            p.stopped = true;
        }
    }
}
