//! Custom assertion helpers for integration tests.

use tilevault_atomic::manifest::{ManifestEntry, ManifestState};
use tilevault_atomic::plan::AtomicWriteStep;

/// Asserts that every step ran in order.
///
/// # Panics
///
/// Panics if `steps` is not the full nine-step sequence.
pub fn assert_full_sequence(steps: &[AtomicWriteStep]) {
    assert_eq!(
        steps,
        AtomicWriteStep::ALL.as_slice(),
        "Expected the full step sequence, got {steps:?}"
    );
}

/// Asserts that execution stopped at `failed` and still released the lease.
///
/// # Panics
///
/// Panics if the steps are not the prefix up to `failed` followed by
/// `release_lock`.
pub fn assert_stopped_at(steps: &[AtomicWriteStep], failed: AtomicWriteStep) {
    let position = AtomicWriteStep::ALL
        .iter()
        .position(|s| *s == failed)
        .expect("known step");
    let mut expected = AtomicWriteStep::ALL[..=position].to_vec();
    expected.push(AtomicWriteStep::ReleaseLock);
    assert_eq!(steps, expected.as_slice(), "Unexpected steps after failure at {failed}");
}

/// Asserts that a manifest entry is committed with a transaction id.
///
/// # Panics
///
/// Panics if the entry is not committed.
pub fn assert_committed(entry: &ManifestEntry) {
    assert_eq!(
        entry.state,
        ManifestState::Committed,
        "Expected manifest {} to be committed, but state was {}",
        entry.id,
        entry.state
    );
    assert!(entry.committed_at.is_some(), "committed entry has no commit time");
    assert!(entry.commit_tx_id.is_some(), "committed entry has no transaction id");
}

/// Asserts that a manifest entry is still pending.
///
/// # Panics
///
/// Panics if the entry left `pending`.
pub fn assert_pending(entry: &ManifestEntry) {
    assert_eq!(
        entry.state,
        ManifestState::Pending,
        "Expected manifest {} to stay pending, but state was {}",
        entry.id,
        entry.state
    );
    assert!(entry.commit_tx_id.is_none());
}
