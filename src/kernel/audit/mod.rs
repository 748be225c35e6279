//! Bounded audit trail.
//!
//! Every failure the engine swallows leaves an entry here. The trail is a
//! side channel: nothing in the turn logic reads it back.
pub mod event;
pub mod recorder;
pub mod summary;

use serde::{Deserialize, Serialize};

pub use event::AuditEvent;
pub use recorder::{AuditRecord, AuditTrail};
pub use summary::AuditSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Off,
    /// Failures, timeouts, session boundaries and hangups.
    Basic,
    /// Adds turn progress.
    Normal,
    /// Adds per-chunk capture activity and probes.
    Verbose,
}

impl Default for AuditLevel {
    fn default() -> Self {
        Self::Normal
    }
}
