//! Extension points for the atomic write sequence.
//!
//! The executor owns ordering and the lease; hooks own the I/O. Each hook
//! runs at most once per execution, only after every earlier step has
//! succeeded, and always while the lease is held.

use async_trait::async_trait;

use tilevault_core::error::Result;

use crate::plan::AtomicWriteExecutionPlan;

/// Filesystem side of an atomic write.
#[async_trait]
pub trait AtomicWriteHooks: Send + Sync {
    /// Writes every file into `plan.tmp_dir`.
    async fn write_files(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;

    /// Flushes the staged file contents.
    async fn fsync_files(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;

    /// Flushes the staging directory entries.
    async fn fsync_tmp_dir(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;

    /// Moves `plan.tmp_dir` onto `plan.final_dir` in one rename.
    async fn atomic_rename(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;

    /// Flushes `plan.final_parent_dir` so the rename survives a crash.
    async fn fsync_parent_dir(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;
}

/// Manifest side of an atomic write.
#[async_trait]
pub trait ManifestHooks: Send + Sync {
    /// Confirms the manifest entry can be committed.
    async fn update_manifest(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;

    /// Marks the manifest entry committed.
    async fn commit_transaction(&self, plan: &AtomicWriteExecutionPlan) -> Result<()>;
}
