use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::summary::{compute_summary, AuditSummary};
use super::{AuditEvent, AuditLevel};
use crate::config::AuditConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Fixed-capacity ring of audit records; the oldest entry goes first.
#[derive(Debug)]
pub struct AuditTrail {
    level: AuditLevel,
    capacity: usize,
    include_transcripts: bool,
    buffer: Mutex<VecDeque<AuditRecord>>,
}

impl AuditTrail {
    pub fn new(config: &AuditConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            level: config.level,
            capacity,
            include_transcripts: config.include_transcripts,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn level(&self) -> AuditLevel {
        self.level
    }

    /// Stores `event` if the trail level admits it. Returns whether it was kept.
    pub fn record(&self, event: AuditEvent) -> bool {
        if self.level == AuditLevel::Off || event.level() > self.level {
            return false;
        }
        let event = if self.include_transcripts { event } else { event.redacted() };
        debug!(target: "parley::audit", kind = event.kind(), ?event);
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(AuditRecord { at: Utc::now(), event });
        true
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.buffer.lock().iter().filter(|r| r.event.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn summary(&self) -> AuditSummary {
        compute_summary(&self.buffer.lock())
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(&AuditConfig::default())
    }
}
