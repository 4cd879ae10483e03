//! Bounded history of atomic write executions.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tilevault_core::config::DEFAULT_DIAGNOSTICS_CAPACITY;
use tilevault_core::error::Result;

use crate::plan::AtomicWriteStep;

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Every step completed.
    Success,
    /// A step failed.
    Failure,
}

impl OperationStatus {
    /// Returns the status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Record of one atomic write execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicWriteDiagnostics {
    /// Target directory.
    pub target_path: String,
    /// Caller identity.
    pub author: String,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When execution ended.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Steps attempted, in order.
    pub steps_executed: Vec<AtomicWriteStep>,
    /// Outcome.
    pub status: OperationStatus,
    /// Error message on failure.
    pub error_message: Option<String>,
    /// Lease acquisition attempts, when known.
    pub lock_attempts: Option<u32>,
    /// Whether acquisition hit contention, when known.
    pub lock_contended: Option<bool>,
}

/// Receives diagnostics records.
pub trait DiagnosticsSink: Send + Sync {
    /// Records one execution.
    ///
    /// # Errors
    ///
    /// A failing sink is logged and otherwise ignored by the executor.
    fn record(&self, entry: AtomicWriteDiagnostics) -> Result<()>;
}

/// Fixed-capacity ring buffer of recent executions.
///
/// Once full, each append evicts the oldest record.
#[derive(Debug)]
pub struct DiagnosticsRepository {
    capacity: usize,
    entries: Mutex<VecDeque<AtomicWriteDiagnostics>>,
}

impl Default for DiagnosticsRepository {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

impl DiagnosticsRepository {
    /// Creates a repository retaining at most `capacity` records.
    ///
    /// A capacity of zero retains nothing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_DIAGNOSTICS_CAPACITY))),
        }
    }

    /// Maximum number of retained records.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record, evicting the oldest when full.
    pub fn append(&self, entry: AtomicWriteDiagnostics) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Returns up to `limit` records, most recent first.
    #[must_use]
    pub fn get_recent(&self, limit: usize) -> Vec<AtomicWriteDiagnostics> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticsSink for DiagnosticsRepository {
    fn record(&self, entry: AtomicWriteDiagnostics) -> Result<()> {
        self.append(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u64) -> AtomicWriteDiagnostics {
        let now = Utc::now();
        AtomicWriteDiagnostics {
            target_path: format!("/t/{n}"),
            author: "svc".into(),
            started_at: now,
            finished_at: now,
            duration_ms: n,
            steps_executed: vec![AtomicWriteStep::AcquireLock, AtomicWriteStep::ReleaseLock],
            status: OperationStatus::Success,
            error_message: None,
            lock_attempts: Some(1),
            lock_contended: Some(false),
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let repo = DiagnosticsRepository::new(2);
        for n in 1..=3 {
            repo.append(entry(n));
        }
        let recent: Vec<u64> = repo.get_recent(10).iter().map(|e| e.duration_ms).collect();
        assert_eq!(recent, vec![3, 2]);
    }

    #[test]
    fn get_recent_respects_limit() {
        let repo = DiagnosticsRepository::default();
        for n in 1..=5 {
            repo.append(entry(n));
        }
        let recent: Vec<u64> = repo.get_recent(2).iter().map(|e| e.duration_ms).collect();
        assert_eq!(recent, vec![5, 4]);
        assert!(repo.get_recent(0).is_empty());
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let repo = DiagnosticsRepository::new(0);
        repo.append(entry(1));
        assert!(repo.is_empty());
    }
}
