//! Write hooks that record what the executor asked of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tilevault_atomic::hooks::AtomicWriteHooks;
use tilevault_atomic::plan::{AtomicWriteExecutionPlan, AtomicWriteStep};
use tilevault_core::error::{Error, Result};

/// In-memory [`AtomicWriteHooks`] with call recording and failure injection.
///
/// Clones share state, so one instance can be handed to several writers
/// and inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    calls: Arc<Mutex<Vec<AtomicWriteStep>>>,
    fail_at: Arc<Mutex<Option<AtomicWriteStep>>>,
    latency: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingHooks {
    /// Creates hooks that succeed at every step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates hooks that fail when `step` runs.
    #[must_use]
    pub fn failing_at(step: AtomicWriteStep) -> Self {
        let hooks = Self::default();
        hooks.inject_failure(step);
        hooks
    }

    /// Creates hooks that sleep for `latency` during `write_files`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Makes the given step fail from now on.
    pub fn inject_failure(&self, step: AtomicWriteStep) {
        *self.fail_at.lock().expect("lock") = Some(step);
    }

    /// Clears any injected failure.
    pub fn clear_failure(&self) {
        *self.fail_at.lock().expect("lock") = None;
    }

    /// Steps invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<AtomicWriteStep> {
        self.calls.lock().expect("lock").clone()
    }

    /// Highest number of writers observed between `write_files` and
    /// `fsync_parent_dir` at the same time.
    ///
    /// A writer leaves that window at `fsync_parent_dir`, at an injected
    /// failure, or when its `write_files` call is dropped.
    #[must_use]
    pub fn max_concurrent_writers(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, step: AtomicWriteStep) -> Result<()> {
        self.calls.lock().expect("lock").push(step);
        if *self.fail_at.lock().expect("lock") == Some(step) {
            if matches!(
                step,
                AtomicWriteStep::FsyncFiles
                    | AtomicWriteStep::FsyncTmpDir
                    | AtomicWriteStep::AtomicRename
            ) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(Error::internal(format!("injected failure at {step}")));
        }
        Ok(())
    }
}

/// Counts a writer in flight; leaves the window on drop unless kept.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    kept: bool,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self {
            counter,
            kept: false,
        }
    }

    /// Leaves the writer counted after this guard is gone.
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AtomicWriteHooks for RecordingHooks {
    async fn write_files(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        self.enter(AtomicWriteStep::WriteFiles)?;
        let writer = InFlight::enter(&self.in_flight, &self.max_in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        writer.keep();
        Ok(())
    }

    async fn fsync_files(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        self.enter(AtomicWriteStep::FsyncFiles)
    }

    async fn fsync_tmp_dir(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        self.enter(AtomicWriteStep::FsyncTmpDir)
    }

    async fn atomic_rename(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        self.enter(AtomicWriteStep::AtomicRename)
    }

    async fn fsync_parent_dir(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.enter(AtomicWriteStep::FsyncParentDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilevault_atomic::manifest::ManifestEntry;
    use tilevault_atomic::plan::{
        build_atomic_write_plan, build_execution_plan, new_manifest_entry, AtomicWriteRequest,
    };

    fn plan() -> AtomicWriteExecutionPlan {
        let request = AtomicWriteRequest {
            op_type: "tile_write".into(),
            author: "svc".into(),
            target_path: "/maps/1/tiles/1".into(),
            tmp_dir: "/tmp/op1".into(),
            expected_files: vec![],
        };
        let manifest = ManifestEntry::pending(1, new_manifest_entry(&request, Default::default()));
        build_execution_plan(build_atomic_write_plan(manifest))
    }

    #[tokio::test]
    async fn injected_failure_ends_the_writer_window() {
        let hooks = RecordingHooks::failing_at(AtomicWriteStep::AtomicRename);
        let plan = plan();
        hooks.write_files(&plan).await.unwrap();
        hooks.fsync_files(&plan).await.unwrap();
        hooks.fsync_tmp_dir(&plan).await.unwrap();
        assert!(hooks.atomic_rename(&plan).await.is_err());

        hooks.clear_failure();
        hooks.write_files(&plan).await.unwrap();
        assert_eq!(hooks.max_concurrent_writers(), 1);
    }

    #[tokio::test]
    async fn dropped_write_ends_the_writer_window() {
        let hooks = RecordingHooks::with_latency(Duration::from_millis(200));
        let plan = plan();
        let dropped =
            tokio::time::timeout(Duration::from_millis(10), hooks.write_files(&plan)).await;
        assert!(dropped.is_err());

        let quick = RecordingHooks {
            latency: None,
            ..hooks.clone()
        };
        quick.write_files(&plan).await.unwrap();
        assert_eq!(hooks.max_concurrent_writers(), 1);
    }
}
