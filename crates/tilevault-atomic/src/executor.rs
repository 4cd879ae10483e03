//! Runs an execution plan under a write lease.
//!
//! ```text
//! acquire_lock ─▶ write_files ─▶ fsync_files ─▶ fsync_tmp_dir ─▶ atomic_rename
//!      │                                                             │
//!      │          commit_tx ◀─ update_manifest ◀─ fsync_parent_dir
//!      ▼              │
//! release_lock ◀──────┘   (also on every failure after acquire)
//! ```
//!
//! A failing step stops the sequence; later steps never run. The lease is
//! released on every path once acquired. If the returned future is dropped
//! mid-sequence, the release is spawned onto the runtime instead.
//!
//! While the steps run, a heartbeat task renews the lease every third of
//! its length. A failed renewal stops the sequence before the next step, so
//! a write that lost its lease never reaches `update_manifest`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use tilevault_core::error::{Error, Result};
use tilevault_core::observability::atomic_write_span;

use crate::diagnostics::{AtomicWriteDiagnostics, DiagnosticsSink, OperationStatus};
use crate::hooks::{AtomicWriteHooks, ManifestHooks};
use crate::lock::{
    acquire_with_retry, AcquireOptions, AcquiredLock, LockManager, LockType, RetryPolicy,
    DEFAULT_LEASE_TTL,
};
use crate::metrics;
use crate::plan::{AtomicWriteExecutionPlan, AtomicWriteStep};

/// Lease settings for the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Lease length requested for each write.
    pub lease_ttl: Duration,
    /// Acquisition retry budget.
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Summary of a successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicWriteReport {
    /// Steps run, in order; always all nine on success.
    pub steps_executed: Vec<AtomicWriteStep>,
    /// Lease acquisition attempts.
    pub lock_attempts: u32,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Shortest interval between lease renewals.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Renewal interval for a lease of length `ttl`.
fn heartbeat_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_HEARTBEAT_INTERVAL)
}

/// Lease shared between the executor and its heartbeat task.
#[derive(Debug)]
struct LeaseState {
    lock: AcquiredLock,
    lost: Option<Error>,
}

struct Heartbeat {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Holds the write lease for one execution.
///
/// Keeps the lease renewed until `release`; if dropped before that, the
/// heartbeat is aborted and the release is spawned onto the runtime.
struct LeaseGuard {
    locks: Arc<dyn LockManager>,
    state: Arc<Mutex<LeaseState>>,
    heartbeat: Option<Heartbeat>,
    held: bool,
}

impl LeaseGuard {
    fn start(locks: Arc<dyn LockManager>, lock: AcquiredLock) -> Self {
        let every = heartbeat_interval(lock.lease_duration());
        let state = Arc::new(Mutex::new(LeaseState { lock, lost: None }));
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(renew_until_stopped(
            Arc::clone(&locks),
            Arc::clone(&state),
            every,
            stopped,
        ));
        Self {
            locks,
            state,
            heartbeat: Some(Heartbeat { stop, task }),
            held: true,
        }
    }

    /// Fails with the renewal error if the lease was lost.
    fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lost.take().map_or(Ok(()), Err)
    }

    fn current(&self) -> AcquiredLock {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lock
            .clone()
    }

    async fn release(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            if heartbeat.stop.send(()).is_err() {
                debug!("lease heartbeat already stopped");
            }
            if let Err(e) = heartbeat.task.await {
                warn!(error = %e, "lease heartbeat task failed");
            }
        }
        self.held = false;
        let lock = self.current();
        self.locks.release(&lock).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.task.abort();
        }
        if !self.held {
            return;
        }
        // Outside a runtime the lease simply expires.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = self.current();
        let locks = Arc::clone(&self.locks);
        handle.spawn(async move {
            if let Err(e) = locks.release(&lock).await {
                warn!(lock_id = %lock.id, error = %e, "deferred lease release failed");
            }
        });
    }
}

/// Renews the lease every `every` until stopped or a renewal fails.
async fn renew_until_stopped(
    locks: Arc<dyn LockManager>,
    state: Arc<Mutex<LeaseState>>,
    every: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => return,
            _ = ticker.tick() => {}
        }

        let current = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lock
            .clone();
        match locks.renew(&current).await {
            Ok(renewed) => {
                debug!(lock_id = %renewed.id, lease_expires = %renewed.lease_expires, "lease renewed");
                state.lock().unwrap_or_else(PoisonError::into_inner).lock = renewed;
            }
            Err(e) => {
                warn!(lock_id = %current.id, error = %e, "lease renewal failed");
                state.lock().unwrap_or_else(PoisonError::into_inner).lost = Some(e);
                return;
            }
        }
    }
}

/// Executes atomic write plans.
pub struct AtomicWriteExecutor {
    locks: Arc<dyn LockManager>,
    options: ExecutorOptions,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl std::fmt::Debug for AtomicWriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicWriteExecutor")
            .field("options", &self.options)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

impl AtomicWriteExecutor {
    /// Creates an executor using `locks` for the write lease.
    #[must_use]
    pub fn new(locks: Arc<dyn LockManager>, options: ExecutorOptions) -> Self {
        Self {
            locks,
            options,
            diagnostics: None,
        }
    }

    /// Reports every execution to `sink`.
    #[must_use]
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// The lock manager guarding writes.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Runs the nine steps of `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockContention`] if the lease could not be taken,
    /// [`Error::HookFailed`] for a filesystem hook failure, any manifest
    /// hook error, or a release error when every other step succeeded.
    pub async fn execute(
        &self,
        plan: &AtomicWriteExecutionPlan,
        hooks: &dyn AtomicWriteHooks,
        manifest_hooks: &dyn ManifestHooks,
    ) -> Result<AtomicWriteReport> {
        let span = atomic_write_span(&plan.manifest.op_type, plan.target_path(), plan.author());
        self.execute_in_span(plan, hooks, manifest_hooks)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        plan: &AtomicWriteExecutionPlan,
        hooks: &dyn AtomicWriteHooks,
        manifest_hooks: &dyn ManifestHooks,
    ) -> Result<AtomicWriteReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut steps = vec![AtomicWriteStep::AcquireLock];

        let options = AcquireOptions::with_ttl(self.options.lease_ttl).metadata(serde_json::json!({
            "manifestId": plan.manifest.id,
            "opType": plan.manifest.op_type,
        }));
        let acquired = acquire_with_retry(
            self.locks.as_ref(),
            &plan.lock_id,
            plan.author(),
            LockType::Write,
            &options,
            &self.options.retry,
        )
        .await;

        let (result, lock_attempts) = match acquired {
            Ok(acquisition) => {
                let lease = LeaseGuard::start(Arc::clone(&self.locks), acquisition.lock);
                let body = run_steps(plan, hooks, manifest_hooks, &lease, &mut steps).await;
                steps.push(AtomicWriteStep::ReleaseLock);
                let released = lease.release().await;
                (settle(body, released), Some(acquisition.attempts))
            }
            Err(e) => {
                let attempts = match &e {
                    Error::LockContention { attempts, .. } => Some(*attempts),
                    _ => None,
                };
                (Err(e), attempts)
            }
        };

        let duration = timer.elapsed();
        let status = if result.is_ok() {
            OperationStatus::Success
        } else {
            OperationStatus::Failure
        };
        metrics::record_atomic_write(status.as_str(), duration.as_secs_f64());

        match &result {
            Ok(()) => info!(
                manifest_id = plan.manifest.id,
                duration_ms = duration.as_millis(),
                "atomic write committed"
            ),
            Err(e) => warn!(
                manifest_id = plan.manifest.id,
                last_step = steps.last().map(AtomicWriteStep::as_str),
                error = %e,
                "atomic write failed"
            ),
        }

        self.report(plan, started_at, duration, &steps, status, &result, lock_attempts);

        result.map(|()| AtomicWriteReport {
            steps_executed: steps,
            lock_attempts: lock_attempts.unwrap_or(1),
            started_at,
            duration,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        plan: &AtomicWriteExecutionPlan,
        started_at: DateTime<Utc>,
        duration: Duration,
        steps: &[AtomicWriteStep],
        status: OperationStatus,
        result: &Result<()>,
        lock_attempts: Option<u32>,
    ) {
        let Some(sink) = &self.diagnostics else {
            return;
        };
        let entry = AtomicWriteDiagnostics {
            target_path: plan.target_path().to_string(),
            author: plan.author().to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            steps_executed: steps.to_vec(),
            status,
            error_message: result.as_ref().err().map(ToString::to_string),
            lock_attempts,
            lock_contended: lock_attempts.map(|attempts| attempts > 1),
        };
        if let Err(e) = sink.record(entry) {
            warn!(error = %e, "diagnostics sink failed");
        }
    }
}

/// Runs the steps between acquire and release, recording each as it starts.
///
/// Stops before the next step once the lease is lost.
async fn run_steps(
    plan: &AtomicWriteExecutionPlan,
    hooks: &dyn AtomicWriteHooks,
    manifest_hooks: &dyn ManifestHooks,
    lease: &LeaseGuard,
    steps: &mut Vec<AtomicWriteStep>,
) -> Result<()> {
    for step in AtomicWriteStep::ALL {
        if matches!(step, AtomicWriteStep::AcquireLock | AtomicWriteStep::ReleaseLock) {
            continue;
        }
        lease.check()?;
        steps.push(step);
        debug!(step = step.as_str(), "running step");
        run_step(step, plan, hooks, manifest_hooks).await?;
    }
    Ok(())
}

async fn run_step(
    step: AtomicWriteStep,
    plan: &AtomicWriteExecutionPlan,
    hooks: &dyn AtomicWriteHooks,
    manifest_hooks: &dyn ManifestHooks,
) -> Result<()> {
    let io = match step {
        AtomicWriteStep::WriteFiles => hooks.write_files(plan).await,
        AtomicWriteStep::FsyncFiles => hooks.fsync_files(plan).await,
        AtomicWriteStep::FsyncTmpDir => hooks.fsync_tmp_dir(plan).await,
        AtomicWriteStep::AtomicRename => hooks.atomic_rename(plan).await,
        AtomicWriteStep::FsyncParentDir => hooks.fsync_parent_dir(plan).await,
        AtomicWriteStep::UpdateManifest => return manifest_hooks.update_manifest(plan).await,
        AtomicWriteStep::CommitTx => {
            return manifest_hooks.commit_transaction(plan).await
        }
        AtomicWriteStep::AcquireLock | AtomicWriteStep::ReleaseLock => return Ok(()),
    };
    io.map_err(|e| Error::hook_failed(step.as_str(), e))
}

/// Combines the body and release outcomes; the body's error wins.
fn settle(body: Result<()>, released: Result<()>) -> Result<()> {
    match (body, released) {
        (Ok(()), released) => released,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(error = %release_err, "lease release failed after a failed write");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_error_wins_over_release_error() {
        let settled = settle(
            Err(Error::internal("body")),
            Err(Error::internal("release")),
        );
        assert!(settled.unwrap_err().to_string().contains("body"));
    }

    #[test]
    fn heartbeat_runs_three_times_per_lease() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(30)),
            Duration::from_secs(10)
        );
        assert_eq!(heartbeat_interval(Duration::ZERO), MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn release_error_surfaces_after_success() {
        let settled = settle(Ok(()), Err(Error::internal("release")));
        assert!(settled.unwrap_err().to_string().contains("release"));
        assert!(settle(Ok(()), Ok(())).is_ok());
    }
}
