//! Playback supervision: write the reply, watch it drain, stop it when it
//! hangs or when the caller barges in.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::barge_in::{BargeInProbe, BargeInVerdict};
use crate::audio::{resample, wav};
use crate::capture::prebuffer::RollingPrebuffer;
use crate::capture::selector::{SourceSelectionState, SourceSelector};
use crate::config::PlaybackPolicy;
use crate::devices::{CallStateProvider, CaptureProvider, PlaybackDevice, PlaybackHandle, PlaybackTarget};
use crate::kernel::audit::{AuditEvent, AuditTrail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackResult {
    Played,
    Interrupted,
    TimedOut { assumed_played: bool },
    Failed,
}

impl PlaybackResult {
    /// Whether the caller can be assumed to have heard the whole reply.
    pub fn counts_as_played(&self) -> bool {
        matches!(self, Self::Played | Self::TimedOut { assumed_played: true })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackReport {
    pub result: PlaybackResult,
    pub target: Option<String>,
    pub duration_ms: u64,
    /// Stopped at the expected end while the device still claimed to be playing.
    pub forced_stop: bool,
    pub prearmed: bool,
}

impl PlaybackReport {
    fn failed() -> Self {
        Self {
            result: PlaybackResult::Failed,
            target: None,
            duration_ms: 0,
            forced_stop: false,
            prearmed: false,
        }
    }
}

/// Capture path used to fill the rolling pre-buffer just before playback ends.
pub struct PrearmSource {
    pub capture: Arc<dyn CaptureProvider>,
    pub selector: Arc<SourceSelector>,
    pub selection: Arc<Mutex<SourceSelectionState>>,
    pub prebuffer: Arc<RollingPrebuffer>,
}

impl PrearmSource {
    async fn capture_tail(&self, chunk_ms: u32) -> u64 {
        let (endpoint_id, format) = {
            let selection = self.selection.lock();
            let Some(endpoint) = self.selector.endpoint(&selection) else {
                return 0;
            };
            let Some(format) = self.selector.capture_formats(&selection).first().copied() else {
                return 0;
            };
            (endpoint.id.clone(), format)
        };
        let capture = Arc::clone(&self.capture);
        let read = tokio::task::spawn_blocking(move || {
            capture.read_chunk(&endpoint_id, chunk_ms, format.sample_rate, format.channels)
        })
        .await;
        match read {
            Ok(Ok(Some(frame))) if !frame.is_empty() => {
                self.prebuffer.append(&frame.samples, frame.sample_rate);
                frame.duration_ms()
            }
            _ => 0,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub struct PlaybackSupervisor {
    policy: PlaybackPolicy,
    targets: Vec<PlaybackTarget>,
    /// Target that last accepted a write; tried first next time.
    preferred: Mutex<Option<String>>,
    device: Arc<dyn PlaybackDevice>,
    call: Arc<dyn CallStateProvider>,
    audit: Arc<AuditTrail>,
    prearm: Option<PrearmSource>,
}

impl PlaybackSupervisor {
    pub fn new(
        policy: PlaybackPolicy,
        targets: Vec<PlaybackTarget>,
        device: Arc<dyn PlaybackDevice>,
        call: Arc<dyn CallStateProvider>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            policy,
            targets,
            preferred: Mutex::new(None),
            device,
            call,
            audit,
            prearm: None,
        }
    }

    pub fn with_prearm(mut self, prearm: PrearmSource) -> Self {
        self.prearm = Some(prearm);
        self
    }

    pub fn preferred_target(&self) -> Option<String> {
        self.preferred.lock().clone()
    }

    fn ordered_targets(&self) -> Vec<PlaybackTarget> {
        let preferred = self.preferred.lock().clone();
        let mut ordered: Vec<PlaybackTarget> = Vec::with_capacity(self.targets.len());
        if let Some(id) = preferred {
            if let Some(target) = self.targets.iter().find(|t| t.id == id) {
                ordered.push(target.clone());
            }
        }
        for target in &self.targets {
            if !ordered.iter().any(|t| t.id == target.id) {
                ordered.push(target.clone());
            }
        }
        ordered
    }

    /// Overall bound for one playback of `duration_ms`.
    pub fn timeout_for(&self, duration_ms: u64) -> u64 {
        (duration_ms + self.policy.timeout_margin_ms).clamp(self.policy.min_timeout_ms, self.policy.max_timeout_ms)
    }

    /// Plays a WAV reply. `echo_reference` is the reply text, used to tell a
    /// real interruption from the reply leaking back into the capture path.
    pub async fn play(&self, wav_bytes: &[u8], echo_reference: &str, barge_in: Option<&BargeInProbe>) -> PlaybackReport {
        let decoded = match wav::decode(wav_bytes) {
            Ok(decoded) if !decoded.samples.is_empty() => decoded,
            Ok(_) => {
                warn!("reply audio is empty");
                self.audit.record(AuditEvent::PlaybackFailed);
                return PlaybackReport::failed();
            }
            Err(e) => {
                warn!(error = %e, "reply audio could not be decoded");
                self.audit.record(AuditEvent::PlaybackFailed);
                return PlaybackReport::failed();
            }
        };

        for target in self.ordered_targets() {
            if !self.call.is_call_active() {
                break;
            }
            let prepared = match resample::prepare_for_playback(&decoded.samples, decoded.sample_rate, &target) {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.device_failed(&target, e.to_string());
                    continue;
                }
            };
            let handle = match self
                .device
                .write(&prepared.pcm, &target, prepared.sample_rate, prepared.channels)
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.device_failed(&target, e.to_string());
                    continue;
                }
            };
            *self.preferred.lock() = Some(target.id.clone());
            let duration_ms = prepared.duration_ms.max(self.policy.min_estimated_duration_ms);
            info!(
                target = %target.id,
                sample_rate = prepared.sample_rate,
                channels = prepared.channels,
                duration_ms,
                "playback started"
            );
            self.audit.record(AuditEvent::PlaybackStarted {
                target: target.id.clone(),
                sample_rate: prepared.sample_rate,
                channels: prepared.channels,
                duration_ms,
            });
            // a write that went through is final; other targets are not retried after it
            return self.monitor(handle, &target, duration_ms, echo_reference, barge_in).await;
        }

        warn!("playback failed on every target");
        self.audit.record(AuditEvent::PlaybackFailed);
        PlaybackReport::failed()
    }

    fn device_failed(&self, target: &PlaybackTarget, detail: String) {
        warn!(target = %target.id, error = %detail, "playback target failed");
        self.audit.record(AuditEvent::PlaybackDeviceFailed {
            target: target.id.clone(),
            detail,
        });
    }

    async fn monitor(
        &self,
        handle: PlaybackHandle,
        target: &PlaybackTarget,
        duration_ms: u64,
        echo_reference: &str,
        barge_in: Option<&BargeInProbe>,
    ) -> PlaybackReport {
        let p = &self.policy;
        let start = Instant::now();
        let deadline = start + ms(self.timeout_for(duration_ms));
        let expected_stop = start + ms(duration_ms + p.stuck_grace_ms);
        let prearm_offset = (duration_ms + p.stuck_grace_ms)
            .saturating_sub(p.prearm_window_ms)
            .max(p.prearm_min_start_after_ms);
        let mut next_prearm = start + ms(prearm_offset);
        let mut prearm_attempts = 0u32;
        let mut prearmed = false;
        let barge_in = barge_in.filter(|probe| probe.enabled());
        let mut next_probe = barge_in.map(|probe| start + ms(probe.policy.arm_delay_ms));

        let mut report = PlaybackReport {
            result: PlaybackResult::Played,
            target: Some(target.id.clone()),
            duration_ms,
            forced_stop: false,
            prearmed: false,
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                self.device.stop(handle);
                let assumed_played = p.timeout_assume_played;
                warn!(target = %target.id, assumed_played, "playback timed out");
                self.audit.record(AuditEvent::PlaybackTimeout {
                    target: target.id.clone(),
                    treated_as_played: assumed_played,
                });
                report.result = PlaybackResult::TimedOut { assumed_played };
                break;
            }
            if !self.call.is_call_active() {
                self.device.stop(handle);
                debug!("call ended during playback");
                report.result = PlaybackResult::Failed;
                break;
            }

            if let Some(prearm) = self.prearm.as_ref().filter(|_| p.prearm_enabled) {
                if !prearmed && prearm_attempts < p.prearm_max_attempts && now >= next_prearm {
                    prearm_attempts += 1;
                    let captured_ms = prearm.capture_tail(p.prearm_chunk_ms).await;
                    self.audit.record(AuditEvent::Prearm {
                        attempt: prearm_attempts,
                        captured_ms,
                    });
                    if captured_ms > 0 {
                        prearmed = true;
                    } else {
                        next_prearm = Instant::now() + ms(p.prearm_retry_ms);
                    }
                }
            }

            if !self.device.is_alive(handle) {
                report.result = PlaybackResult::Played;
                break;
            }
            if Instant::now() >= expected_stop {
                self.device.stop(handle);
                debug!(target = %target.id, "playback still alive past its expected end, stopped");
                self.audit.record(AuditEvent::PlaybackForcedStop {
                    target: target.id.clone(),
                });
                report.forced_stop = true;
                report.result = PlaybackResult::Played;
                break;
            }

            if let (Some(probe), Some(at)) = (barge_in, next_probe) {
                if Instant::now() >= at {
                    next_probe = Some(Instant::now() + ms(probe.policy.probe_interval_ms));
                    let verdict = probe.probe(echo_reference).await;
                    if verdict.interrupts() {
                        self.device.stop(handle);
                        let rms = match verdict {
                            BargeInVerdict::Energy { rms } | BargeInVerdict::Strong { rms } => rms,
                            _ => 0.0,
                        };
                        self.audit.record(AuditEvent::BargeIn {
                            mode: verdict.mode().to_string(),
                            rms,
                        });
                        report.result = PlaybackResult::Interrupted;
                        break;
                    }
                }
            }

            tokio::time::sleep(ms(p.poll_ms.max(1))).await;
        }

        report.prearmed = prearmed;
        report
    }
}
