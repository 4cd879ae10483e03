//! Atomic-write metrics.
//!
//! Counters and histograms for lock acquisition and write execution. They
//! complement the structured logs; nothing in the crate reads them back.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Lock Metrics
// ============================================================================

/// Lock acquisition attempts, labelled by outcome.
pub const LOCK_ATTEMPTS: &str = "tilevault_lock_attempts_total";

/// Acquisitions that exhausted their retry budget.
pub const LOCK_CONTENTION: &str = "tilevault_lock_contention_total";

// ============================================================================
// Atomic Write Metrics
// ============================================================================

/// Atomic write executions, labelled by status.
pub const ATOMIC_WRITES: &str = "tilevault_atomic_writes_total";

/// Atomic write duration histogram.
pub const ATOMIC_WRITE_DURATION: &str = "tilevault_atomic_write_duration_seconds";

/// Registers all metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(LOCK_ATTEMPTS, "Total lock acquisition attempts");
    describe_counter!(
        LOCK_CONTENTION,
        "Total lock acquisitions that gave up after retrying"
    );
    describe_counter!(ATOMIC_WRITES, "Total atomic write executions");
    describe_histogram!(
        ATOMIC_WRITE_DURATION,
        "Duration of atomic write executions in seconds"
    );
}

/// Records one acquisition attempt (`acquired`, `contended` or `error`).
pub fn record_lock_attempt(outcome: &'static str) {
    counter!(LOCK_ATTEMPTS, "outcome" => outcome).increment(1);
}

/// Records an acquisition that ran out of attempts.
pub fn record_lock_contention() {
    counter!(LOCK_CONTENTION).increment(1);
}

/// Records a finished atomic write.
pub fn record_atomic_write(status: &'static str, duration_secs: f64) {
    counter!(ATOMIC_WRITES, "status" => status).increment(1);
    histogram!(ATOMIC_WRITE_DURATION, "status" => status).record(duration_secs);
}
