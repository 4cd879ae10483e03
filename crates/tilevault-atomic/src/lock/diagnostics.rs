//! Diagnostics decorator for lock managers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tilevault_core::error::Result;

use super::{AcquireOptions, AcquiredLock, LockManager, LockType};

/// Lock manager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOperation {
    /// `acquire`.
    Acquire,
    /// `renew`.
    Renew,
    /// `release`.
    Release,
}

/// One lock manager call and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDiagnosticEvent {
    /// Which call was made.
    pub operation: LockOperation,
    /// Lock identifier.
    pub lock_id: String,
    /// Owner presented by the caller.
    pub owner_id: String,
    /// Requested or held lease mode.
    pub lock_type: LockType,
    /// When the call finished.
    pub at: DateTime<Utc>,
    /// Error message, if the call failed.
    pub error: Option<String>,
}

impl LockDiagnosticEvent {
    /// Returns whether the call succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives lock diagnostic events.
pub trait LockDiagnosticsSink: Send + Sync {
    /// Records one event.
    ///
    /// # Errors
    ///
    /// A failing sink is logged and otherwise ignored.
    fn record(&self, event: &LockDiagnosticEvent) -> Result<()>;
}

impl<F> LockDiagnosticsSink for F
where
    F: Fn(&LockDiagnosticEvent) -> Result<()> + Send + Sync,
{
    fn record(&self, event: &LockDiagnosticEvent) -> Result<()> {
        self(event)
    }
}

/// Wraps a lock manager and reports every call to a sink.
///
/// Results from the inner manager are returned unchanged; sink failures
/// never alter them.
pub struct DiagnosedLockManager {
    inner: Arc<dyn LockManager>,
    sink: Arc<dyn LockDiagnosticsSink>,
}

impl DiagnosedLockManager {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn LockManager>, sink: Arc<dyn LockDiagnosticsSink>) -> Self {
        Self { inner, sink }
    }

    fn report<T>(
        &self,
        operation: LockOperation,
        lock_id: &str,
        owner_id: &str,
        lock_type: LockType,
        result: &Result<T>,
    ) {
        let event = LockDiagnosticEvent {
            operation,
            lock_id: lock_id.to_string(),
            owner_id: owner_id.to_string(),
            lock_type,
            at: Utc::now(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.sink.record(&event) {
            warn!(lock_id, ?operation, error = %e, "lock diagnostics sink failed");
        }
    }
}

impl std::fmt::Debug for DiagnosedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosedLockManager").finish_non_exhaustive()
    }
}

#[async_trait]
impl LockManager for DiagnosedLockManager {
    async fn acquire(
        &self,
        lock_id: &str,
        owner_id: &str,
        lock_type: LockType,
        options: &AcquireOptions,
    ) -> Result<AcquiredLock> {
        let result = self
            .inner
            .acquire(lock_id, owner_id, lock_type, options)
            .await;
        self.report(LockOperation::Acquire, lock_id, owner_id, lock_type, &result);
        result
    }

    async fn renew(&self, lock: &AcquiredLock) -> Result<AcquiredLock> {
        let result = self.inner.renew(lock).await;
        self.report(
            LockOperation::Renew,
            &lock.id,
            &lock.owner_id,
            lock.lock_type,
            &result,
        );
        result
    }

    async fn release(&self, lock: &AcquiredLock) -> Result<()> {
        let result = self.inner.release(lock).await;
        self.report(
            LockOperation::Release,
            &lock.id,
            &lock.owner_id,
            lock.lock_type,
            &result,
        );
        result
    }
}
