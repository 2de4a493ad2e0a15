//! Side-effect counters and a bounded audit trail.
//!
//! Nothing in the crate reads these back except tests and operators; they
//! exist so that failures which are deliberately not surfaced (stale merges,
//! dropped dispatches, clock drift) stay visible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Counters {
    dispatch_sent: AtomicU64,
    dispatch_retried: AtomicU64,
    dispatch_failed: AtomicU64,
    merges_applied: AtomicU64,
    merges_stale: AtomicU64,
    merges_rejected: AtomicU64,
    timer_fires: AtomicU64,
    clock_drift_alarms: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub dispatch_sent: u64,
    pub dispatch_retried: u64,
    pub dispatch_failed: u64,
    pub merges_applied: u64,
    pub merges_stale: u64,
    pub merges_rejected: u64,
    pub timer_fires: u64,
    pub clock_drift_alarms: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_sent(&self) {
        Self::bump(&self.dispatch_sent);
    }

    pub fn dispatch_retried(&self) {
        Self::bump(&self.dispatch_retried);
    }

    pub fn dispatch_failed(&self) {
        Self::bump(&self.dispatch_failed);
    }

    pub fn merge_applied(&self) {
        Self::bump(&self.merges_applied);
    }

    pub fn merge_stale(&self) {
        Self::bump(&self.merges_stale);
    }

    pub fn merge_rejected(&self) {
        Self::bump(&self.merges_rejected);
    }

    pub fn timer_fired(&self) {
        Self::bump(&self.timer_fires);
    }

    pub fn clock_drift_alarm(&self) {
        Self::bump(&self.clock_drift_alarms);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            dispatch_sent: load(&self.dispatch_sent),
            dispatch_retried: load(&self.dispatch_retried),
            dispatch_failed: load(&self.dispatch_failed),
            merges_applied: load(&self.merges_applied),
            merges_stale: load(&self.merges_stale),
            merges_rejected: load(&self.merges_rejected),
            timer_fires: load(&self.timer_fires),
            clock_drift_alarms: load(&self.clock_drift_alarms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Admin,
    Harvest,
    Dispatch,
    ClockDrift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub category: AuditCategory,
    pub message: String,
}

/// Keeps the most recent entries, oldest dropped first.
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(1000)
    }
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, category: AuditCategory, message: String) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(AuditEntry {
            at: Utc::now(),
            category,
            message,
        });
    }

    /// Records an administrative or informational event.
    pub fn record(&self, category: AuditCategory, message: impl Into<String>) {
        let message = message.into();
        info!(?category, "{message}");
        self.push(category, message);
    }

    /// Records a failure that is handled without surfacing an error.
    pub fn failure(&self, category: AuditCategory, message: impl Into<String>) {
        let message = message.into();
        warn!(?category, "{message}");
        self.push(category, message);
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::new();
        counters.dispatch_sent();
        counters.dispatch_sent();
        counters.merge_stale();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.dispatch_sent, 2);
        assert_eq!(snapshot.merges_stale, 1);
        assert_eq!(snapshot.merges_applied, 0);
    }

    #[test]
    fn test_audit_log_is_bounded() {
        let log = AuditLog::with_capacity(2);
        log.record(AuditCategory::Admin, "first");
        log.failure(AuditCategory::Harvest, "second");
        log.record(AuditCategory::Admin, "third");

        let messages: Vec<_> = log.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["second", "third"]);

        log.clear();
        assert!(log.entries().is_empty());
    }
}
