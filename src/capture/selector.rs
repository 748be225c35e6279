use tracing::{debug, info, warn};

use crate::audio::analysis::rms;
use crate::config::SelectorPolicy;
use crate::devices::{CaptureEndpoint, CaptureProvider};

/// Everything that changes while a call hunts for a working capture path.
///
/// Owned by the caller and threaded through [`SourceSelector`], so the failure
/// policy can be exercised without devices or timers.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSelectionState {
    pub endpoint_index: Option<usize>,
    pub pinned: bool,
    pub current_sample_rate: Option<u32>,
    pub current_channels: Option<u16>,
    pub consecutive_failures: u32,
    pub calibrated: bool,
    pub last_calibration_ms: Option<u64>,
    /// Startup recovery stays active until this instant, unless completed earlier.
    pub startup_recovery_until_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Circumstances of a failed capture read.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureContext {
    pub now_ms: u64,
    pub speaking: bool,
    /// Inside the short window that follows playback.
    pub fast_endpoint: bool,
}

/// Side effects the caller must carry out after a failure was recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureResponse {
    pub failures: u32,
    pub restart_stream: bool,
    pub unpinned: bool,
    pub rotated_to: Option<String>,
    pub recover_route: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeScore {
    pub endpoint_id: String,
    pub rms: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub scores: Vec<ProbeScore>,
    /// Index of the loudest endpoint, if it cleared the calibration floor.
    pub selected: Option<usize>,
}

impl ProbeOutcome {
    pub fn best_rms(&self) -> f64 {
        self.scores.iter().map(|s| s.rms).fold(0.0, f64::max)
    }
}

pub struct SourceSelector {
    endpoints: Vec<CaptureEndpoint>,
    policy: SelectorPolicy,
}

impl SourceSelector {
    pub fn new(endpoints: Vec<CaptureEndpoint>, policy: SelectorPolicy) -> Self {
        Self { endpoints, policy }
    }

    pub fn endpoints(&self) -> &[CaptureEndpoint] {
        &self.endpoints
    }

    pub fn policy(&self) -> &SelectorPolicy {
        &self.policy
    }

    /// Fresh selection for a new call: first endpoint, requested format, unpinned.
    pub fn start_session(&self, now_ms: u64) -> SourceSelectionState {
        let startup_recovery_until_ms = self
            .policy
            .startup_recovery_enabled
            .then(|| now_ms + self.policy.startup_recovery_window_ms);
        SourceSelectionState {
            endpoint_index: (!self.endpoints.is_empty()).then_some(0),
            pinned: false,
            current_sample_rate: Some(self.policy.request_sample_rate),
            current_channels: Some(self.policy.primary_channels),
            consecutive_failures: 0,
            calibrated: false,
            last_calibration_ms: None,
            startup_recovery_until_ms,
        }
    }

    pub fn endpoint<'a>(&'a self, state: &SourceSelectionState) -> Option<&'a CaptureEndpoint> {
        state.endpoint_index.and_then(|i| self.endpoints.get(i))
    }

    /// Formats to try for the next read, most preferred first. A pinned
    /// selection only ever offers its pinned format.
    pub fn capture_formats(&self, state: &SourceSelectionState) -> Vec<CaptureFormat> {
        if state.pinned {
            if let (Some(sample_rate), Some(channels)) = (state.current_sample_rate, state.current_channels) {
                return vec![CaptureFormat { sample_rate, channels }];
            }
        }
        let endpoint = self.endpoint(state);
        let supports = |f: &CaptureFormat| {
            endpoint.map_or(true, |e| e.supports_rate(f.sample_rate) && e.supports_channels(f.channels))
        };

        let mut rates = vec![state.current_sample_rate.unwrap_or(self.policy.request_sample_rate)];
        rates.extend(self.policy.sample_rate_candidates.iter().copied());
        let mut channels = vec![state.current_channels.unwrap_or(self.policy.primary_channels)];
        channels.extend(self.policy.channel_candidates.iter().copied());

        let mut formats: Vec<CaptureFormat> = Vec::new();
        for &sample_rate in &rates {
            for &ch in &channels {
                let format = CaptureFormat {
                    sample_rate,
                    channels: ch,
                };
                if format.sample_rate > 0 && format.channels > 0 && supports(&format) && !formats.contains(&format) {
                    formats.push(format);
                }
            }
        }
        if formats.is_empty() {
            formats.push(CaptureFormat {
                sample_rate: self.policy.request_sample_rate,
                channels: self.policy.primary_channels,
            });
        }
        formats
    }

    /// Remembers the format a read actually succeeded with.
    pub fn record_format(&self, state: &mut SourceSelectionState, format: CaptureFormat) {
        if state.pinned {
            return;
        }
        state.current_sample_rate = Some(format.sample_rate);
        state.current_channels = Some(format.channels);
    }

    pub fn record_success(&self, state: &mut SourceSelectionState) {
        state.consecutive_failures = 0;
    }

    pub fn in_startup_recovery(&self, state: &SourceSelectionState, now_ms: u64) -> bool {
        matches!(state.startup_recovery_until_ms, Some(until) if now_ms < until)
    }

    /// Ends startup recovery early, typically after the first completed turn.
    pub fn complete_startup_recovery(&self, state: &mut SourceSelectionState) -> bool {
        if state.startup_recovery_until_ms.take().is_none() {
            return false;
        }
        state.consecutive_failures = 0;
        true
    }

    /// Counts one failed read and decides what the caller should do about it.
    pub fn record_failure(&self, state: &mut SourceSelectionState, ctx: FailureContext) -> FailureResponse {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.consecutive_failures;
        let startup = self.in_startup_recovery(state, ctx.now_ms);
        let p = &self.policy;
        let mut response = FailureResponse {
            failures,
            recover_route: true,
            ..FailureResponse::default()
        };

        if ctx.fast_endpoint && !ctx.speaking && failures >= p.fast_post_playback_rebind_threshold {
            response.restart_stream = true;
            let unpin_at = if startup {
                p.startup_fast_post_playback_unpin_threshold
            } else {
                p.fast_post_playback_unpin_threshold
            };
            if failures >= unpin_at {
                response.unpinned |= self.unpin(state, "fast_post_playback_no_audio");
            }
        }
        if failures >= p.stream_restart_threshold {
            response.restart_stream = true;
        }
        let unpin_at = if startup {
            p.startup_no_audio_unpin_threshold
        } else {
            p.no_audio_unpin_threshold
        };
        if failures >= unpin_at {
            response.unpinned |= self.unpin(state, "no_audio_streak");
        }
        let rotate_at = if startup {
            p.startup_rotate_threshold
        } else {
            p.source_rotate_threshold
        };
        if failures >= rotate_at {
            response.rotated_to = self.rotate(state).map(|e| e.id.clone());
        }
        debug!(failures, startup, ?response, "capture failure recorded");
        response
    }

    /// Locks the current endpoint and format. Returns whether anything changed.
    pub fn pin(&self, state: &mut SourceSelectionState) -> bool {
        if state.pinned {
            return false;
        }
        let Some(endpoint) = self.endpoint(state) else {
            return false;
        };
        state.pinned = true;
        state.calibrated = true;
        state.current_sample_rate.get_or_insert(self.policy.request_sample_rate);
        state.current_channels.get_or_insert(self.policy.primary_channels);
        info!(endpoint = %endpoint.id, "capture source pinned");
        true
    }

    pub fn unpin(&self, state: &mut SourceSelectionState, reason: &str) -> bool {
        if !state.pinned {
            return false;
        }
        state.pinned = false;
        state.calibrated = false;
        state.current_sample_rate = None;
        state.current_channels = None;
        // the next capture re-probes immediately, whatever the throttle says
        state.last_calibration_ms = None;
        warn!(reason, "capture source unpinned");
        true
    }

    /// Advances to the next endpoint in cyclic order. Does nothing while pinned.
    pub fn rotate<'a>(&'a self, state: &mut SourceSelectionState) -> Option<&'a CaptureEndpoint> {
        if state.pinned || self.endpoints.is_empty() {
            return None;
        }
        let next = match state.endpoint_index {
            Some(i) => (i + 1) % self.endpoints.len(),
            None => 0,
        };
        state.endpoint_index = Some(next);
        state.calibrated = false;
        let endpoint = &self.endpoints[next];
        info!(endpoint = %endpoint.id, "capture source rotated");
        Some(endpoint)
    }

    pub fn invalidate_calibration(&self, state: &mut SourceSelectionState) {
        state.calibrated = false;
    }

    pub fn needs_calibration(&self, state: &SourceSelectionState, now_ms: u64, force: bool) -> bool {
        if self.endpoints.is_empty() {
            return false;
        }
        if force {
            return true;
        }
        if state.calibrated || state.pinned {
            return false;
        }
        match state.last_calibration_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.policy.calibration_throttle_ms,
            None => true,
        }
    }

    /// Captures a short sample from every endpoint and picks the loudest one,
    /// provided it clears the calibration floor.
    pub fn probe(&self, capture: &dyn CaptureProvider, sample_rate: u32) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        let mut best: Option<(usize, f64)> = None;
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let frame = match capture.read_chunk(
                &endpoint.id,
                self.policy.probe_capture_ms,
                sample_rate,
                self.policy.primary_channels,
            ) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    debug!(endpoint = %endpoint.id, error = %e, "probe read failed");
                    continue;
                }
            };
            let level = rms(&frame.samples);
            debug!(endpoint = %endpoint.id, rms = level, "probe");
            outcome.scores.push(ProbeScore {
                endpoint_id: endpoint.id.clone(),
                rms: level,
            });
            if best.map_or(true, |(_, b)| level > b) {
                best = Some((index, level));
            }
        }
        outcome.selected = match best {
            Some((index, level)) if level >= self.policy.calibration_min_rms => Some(index),
            Some((_, level)) => {
                warn!(best = level, "probe rejected all sources below calibration floor");
                None
            }
            None => None,
        };
        outcome
    }

    /// Applies a probe result. A pinned selection is left alone.
    pub fn apply_probe(&self, state: &mut SourceSelectionState, outcome: &ProbeOutcome, now_ms: u64) -> bool {
        state.last_calibration_ms = Some(now_ms);
        if state.pinned {
            return false;
        }
        match outcome.selected {
            Some(index) => {
                state.endpoint_index = Some(index);
                state.calibrated = true;
                state.current_sample_rate = Some(self.policy.request_sample_rate);
                state.current_channels = Some(self.policy.primary_channels);
                true
            }
            None => {
                state.calibrated = false;
                false
            }
        }
    }
}
