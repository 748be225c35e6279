use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::call_state::SharedCallState;
use super::{AudioFrame, CaptureProvider, DeviceError};
use crate::audio::{resample, wav};

/// Capture that replays one recording, chunk by chunk, on every endpoint.
///
/// All endpoints share a single read position, as if they tapped the same
/// line. Endpoints marked silent return nothing.
pub struct WavFileCapture {
    samples: Vec<i16>,
    sample_rate: u32,
    position: Mutex<usize>,
    silent: HashSet<String>,
    realtime: bool,
    /// Ended when the recording runs out.
    call: Option<Arc<SharedCallState>>,
}

impl WavFileCapture {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| DeviceError::Io(format!("{}: {e}", path.display())))?;
        let decoded = wav::decode(&bytes).map_err(|e| DeviceError::Io(e.to_string()))?;
        info!(
            path = %path.display(),
            sample_rate = decoded.sample_rate,
            duration_ms = decoded.duration_ms(),
            "loaded capture recording"
        );
        Ok(Self::from_samples(decoded.samples, decoded.sample_rate))
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            position: Mutex::new(0),
            silent: HashSet::new(),
            realtime: false,
            call: None,
        }
    }

    pub fn with_silent_endpoint(mut self, id: impl Into<String>) -> Self {
        self.silent.insert(id.into());
        self
    }

    /// Sleep for each chunk's duration so reads pace like a live source.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn end_call_at_eof(mut self, call: Arc<SharedCallState>) -> Self {
        self.call = Some(call);
        self
    }

    pub fn position_ms(&self) -> u64 {
        *self.position.lock() as u64 * 1_000 / self.sample_rate.max(1) as u64
    }

    pub fn is_exhausted(&self) -> bool {
        *self.position.lock() >= self.samples.len()
    }
}

impl CaptureProvider for WavFileCapture {
    fn read_chunk(
        &self,
        endpoint_id: &str,
        duration_ms: u32,
        sample_rate: u32,
        _channels: u16,
    ) -> Result<Option<AudioFrame>, DeviceError> {
        if sample_rate == 0 {
            return Err(DeviceError::Io("zero sample rate requested".to_string()));
        }
        if self.silent.contains(endpoint_id) {
            return Ok(None);
        }
        let chunk = {
            let mut position = self.position.lock();
            if *position >= self.samples.len() {
                if let Some(call) = &self.call {
                    debug!("capture recording exhausted, ending call");
                    call.end();
                }
                return Ok(None);
            }
            let wanted = (self.sample_rate as u64 * duration_ms as u64 / 1_000) as usize;
            let end = (*position + wanted.max(1)).min(self.samples.len());
            let chunk = self.samples[*position..end].to_vec();
            *position = end;
            chunk
        };
        if self.realtime {
            std::thread::sleep(Duration::from_millis(duration_ms as u64));
        }
        let captured_at_ms = self.position_ms();
        let samples = resample::linear(&chunk, self.sample_rate, sample_rate);
        Ok(Some(AudioFrame::new(samples, sample_rate, captured_at_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_and_resample() {
        let capture = WavFileCapture::from_samples(vec![100; 16_000], 16_000);
        let frame = capture.read_chunk("20", 100, 8_000, 1).unwrap().unwrap();
        assert_eq!(frame.sample_rate, 8_000);
        assert_eq!(frame.samples.len(), 800);
        assert_eq!(capture.position_ms(), 100);
    }

    #[test]
    fn silent_endpoint_and_eof_yield_nothing() {
        let call = Arc::new(SharedCallState::default());
        let capture = WavFileCapture::from_samples(vec![1; 160], 16_000)
            .with_silent_endpoint("21")
            .end_call_at_eof(Arc::clone(&call));
        assert!(capture.read_chunk("21", 20, 16_000, 1).unwrap().is_none());
        assert!(capture.read_chunk("20", 20, 16_000, 1).unwrap().is_some());
        assert!(capture.read_chunk("20", 20, 16_000, 1).unwrap().is_none());
        assert!(!crate::devices::CallStateProvider::is_call_active(call.as_ref()));
    }
}
