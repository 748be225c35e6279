use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// One phone call, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    /// Conversation handle issued by the dialogue backend on the first turn.
    pub backend_session_id: Option<String>,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
    pub started_at_ms: u64,
    /// Last reply that was actually played, for echo detection.
    pub last_reply: Option<String>,
    pub last_playback_end_ms: Option<u64>,
    pub turns: u32,
}

impl CallSession {
    pub fn new(direction: CallDirection, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_session_id: None,
            direction,
            started_at: Utc::now(),
            started_at_ms: now_ms,
            last_reply: None,
            last_playback_end_ms: None,
            turns: 0,
        }
    }

    pub fn since_playback_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_playback_end_ms.map(|end| now_ms.saturating_sub(end))
    }
}

/// Flags read by background tasks without taking the session lock.
#[derive(Debug)]
pub struct SessionFlags {
    active: AtomicBool,
    turn_in_flight: AtomicBool,
    last_activity_ms: AtomicU64,
}

impl SessionFlags {
    pub fn new(now_ms: u64) -> Self {
        Self {
            active: AtomicBool::new(true),
            turn_in_flight: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Claims the single turn slot. Returns false when a turn is already running.
    pub fn try_begin_turn(&self) -> bool {
        self.turn_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_turn(&self) {
        self.turn_in_flight.store(false, Ordering::Release);
    }

    pub fn turn_in_flight(&self) -> bool {
        self.turn_in_flight.load(Ordering::Acquire)
    }

    pub fn mark_activity(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }
}

/// Releases the turn slot when dropped, on every exit path.
pub struct TurnGuard<'a> {
    flags: &'a SessionFlags,
}

impl<'a> TurnGuard<'a> {
    pub fn acquire(flags: &'a SessionFlags) -> Option<Self> {
        flags.try_begin_turn().then(|| Self { flags })
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.flags.end_turn();
    }
}
