use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::audit::{AuditEvent, AuditTrail};
use super::session::SessionFlags;
use super::tasks::TaskPool;
use super::time::Clock;
use crate::config::WatchdogPolicy;
use crate::devices::CallStateProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    CallEnded,
    /// A turn is running; idleness is not judged mid-turn.
    Busy,
    Quiet { idle_ms: u64 },
    HungUp { idle_ms: u64 },
}

/// Ends the call once neither the caller nor the assistant has been heard for
/// a long stretch. The only place the engine hangs up on its own.
pub struct SilenceWatchdog {
    policy: WatchdogPolicy,
    flags: Arc<SessionFlags>,
    call: Arc<dyn CallStateProvider>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditTrail>,
}

impl SilenceWatchdog {
    pub fn new(
        policy: WatchdogPolicy,
        flags: Arc<SessionFlags>,
        call: Arc<dyn CallStateProvider>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            policy,
            flags,
            call,
            clock,
            audit,
        }
    }

    pub fn check(&self, now_ms: u64) -> WatchdogVerdict {
        if !self.flags.is_active() || !self.call.is_call_active() {
            return WatchdogVerdict::CallEnded;
        }
        if self.flags.turn_in_flight() {
            return WatchdogVerdict::Busy;
        }
        let idle_ms = now_ms.saturating_sub(self.flags.last_activity_ms());
        if idle_ms < self.policy.silence_hangup_ms {
            return WatchdogVerdict::Quiet { idle_ms };
        }

        info!(idle_ms, "no conversational activity, hanging up");
        self.audit.record(AuditEvent::SilenceHangup { idle_ms });
        if let Err(e) = self.call.hang_up() {
            warn!(error = %e, "hang up failed");
            self.audit.record(AuditEvent::HangupFailed { detail: e.to_string() });
        }
        self.flags.deactivate();
        WatchdogVerdict::HungUp { idle_ms }
    }

    /// Runs `check` on the policy interval until the call ends.
    pub fn spawn(self: Arc<Self>, pool: &TaskPool) -> bool {
        let period = Duration::from_millis(self.policy.check_interval_ms.max(1));
        pool.spawn("silence_watchdog", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match self.check(self.clock.now_ms()) {
                    WatchdogVerdict::CallEnded | WatchdogVerdict::HungUp { .. } => break,
                    WatchdogVerdict::Busy | WatchdogVerdict::Quiet { .. } => {}
                }
            }
        })
    }
}
