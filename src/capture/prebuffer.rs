use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::audio::resample;

struct PrebufferState {
    ring: HeapRb<i16>,
    sample_rate: u32,
}

/// Most recent pre-speech audio, carried across segmentation attempts.
///
/// Writers append whole chunks; a change of sample rate starts a fresh ring.
pub struct RollingPrebuffer {
    capacity_ms: u32,
    state: Mutex<Option<PrebufferState>>,
}

impl RollingPrebuffer {
    pub fn new(capacity_ms: u32) -> Self {
        Self {
            capacity_ms,
            state: Mutex::new(None),
        }
    }

    fn capacity_for(&self, sample_rate: u32) -> usize {
        ((sample_rate as u64 * self.capacity_ms as u64 / 1_000) as usize).max(1)
    }

    pub fn append(&self, samples: &[i16], sample_rate: u32) {
        if samples.is_empty() || sample_rate == 0 || self.capacity_ms == 0 {
            return;
        }
        let mut guard = self.state.lock();
        let fresh = match guard.as_ref() {
            Some(state) => state.sample_rate != sample_rate,
            None => true,
        };
        if fresh {
            *guard = Some(PrebufferState {
                ring: HeapRb::new(self.capacity_for(sample_rate)),
                sample_rate,
            });
        }
        if let Some(state) = guard.as_mut() {
            state.ring.push_slice_overwrite(samples);
        }
    }

    /// Drains the buffer, converted to `target_rate`.
    pub fn take(&self, target_rate: u32) -> Vec<i16> {
        let mut guard = self.state.lock();
        let Some(mut state) = guard.take() else {
            return Vec::new();
        };
        let samples: Vec<i16> = state.ring.pop_iter().collect();
        resample::linear(&samples, state.sample_rate, target_rate)
    }

    pub fn clear(&self) {
        *self.state.lock() = None;
    }

    pub fn duration_ms(&self) -> u64 {
        match self.state.lock().as_ref() {
            Some(state) if state.sample_rate > 0 => {
                state.ring.occupied_len() as u64 * 1_000 / state.sample_rate as u64
            }
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duration_ms() == 0
    }
}
