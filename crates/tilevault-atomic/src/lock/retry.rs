//! Bounded retry around [`LockManager::acquire`].

use std::time::Duration;

use tracing::{debug, Instrument};

use tilevault_core::config::LockRetryConfig;
use tilevault_core::error::{Error, Result};
use tilevault_core::observability::lock_span;

use super::{AcquireOptions, AcquiredLock, LockManager, LockType};
use crate::metrics;

/// Exponential backoff budget for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first contended attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each contended attempt.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl From<&LockRetryConfig> for RetryPolicy {
    fn from(config: &LockRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the `attempt`-th contended attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A lease obtained through [`acquire_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockAcquisition {
    /// The lease.
    pub lock: AcquiredLock,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

impl LockAcquisition {
    /// Returns whether at least one attempt hit contention.
    #[must_use]
    pub const fn contended(&self) -> bool {
        self.attempts > 1
    }
}

/// Acquires a lease, retrying contention with exponential backoff.
///
/// Only [`Error::LockContention`] is retried; any other error is returned
/// on the attempt that produced it.
///
/// # Errors
///
/// Returns [`Error::LockContention`] carrying the total attempt count once
/// the budget is exhausted, or the first non-contention error.
pub async fn acquire_with_retry(
    manager: &dyn LockManager,
    lock_id: &str,
    owner_id: &str,
    lock_type: LockType,
    options: &AcquireOptions,
    policy: &RetryPolicy,
) -> Result<LockAcquisition> {
    let max_attempts = policy.max_attempts.max(1);

    async {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match manager.acquire(lock_id, owner_id, lock_type, options).await {
                Ok(lock) => {
                    metrics::record_lock_attempt("acquired");
                    debug!(attempts, "lock acquired");
                    return Ok(LockAcquisition { lock, attempts });
                }
                Err(Error::LockContention { holder, .. }) => {
                    metrics::record_lock_attempt("contended");
                    if attempts >= max_attempts {
                        metrics::record_lock_contention();
                        debug!(attempts, %holder, "giving up on contended lock");
                        return Err(Error::LockContention {
                            lock_id: lock_id.to_string(),
                            holder,
                            attempts,
                        });
                    }
                    let delay = policy.delay_after(attempts);
                    debug!(attempts, %holder, delay_ms = delay.as_millis(), "lock contended, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::record_lock_attempt("error");
                    return Err(e);
                }
            }
        }
    }
    .instrument(lock_span("acquire", lock_id, owner_id))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockManager;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (1..=6).map(|n| policy.delay_after(n).as_millis()).collect();
        assert_eq!(delays, vec![25, 50, 100, 200, 400, 500]);
    }

    #[test]
    fn policy_from_config() {
        let config = LockRetryConfig {
            max_attempts: 0,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after(5), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn uncontended_acquire_takes_one_attempt() {
        let locks = InMemoryLockManager::new();
        let acquired = acquire_with_retry(
            &locks,
            "x",
            "a",
            LockType::Write,
            &AcquireOptions::default(),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(acquired.attempts, 1);
        assert!(!acquired.contended());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_all_attempts() {
        let locks = InMemoryLockManager::new();
        locks
            .acquire("x", "a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let err = acquire_with_retry(
            &locks,
            "x",
            "b",
            LockType::Write,
            &AcquireOptions::default(),
            &RetryPolicy::default(),
        )
        .await
        .unwrap_err();

        match err {
            Error::LockContention { holder, attempts, .. } => {
                assert_eq!(holder, "a");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
