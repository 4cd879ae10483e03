//! Request-level entry point: record, plan, execute.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use ulid::Ulid;

use tilevault_core::error::{Error, Result};

use crate::executor::{AtomicWriteExecutor, AtomicWriteReport};
use crate::hooks::{AtomicWriteHooks, ManifestHooks};
use crate::manifest::{ManifestEntry, ManifestRepository, ManifestState};
use crate::plan::{
    build_atomic_write_plan, build_execution_plan, new_manifest_entry, AtomicWritePlan,
    AtomicWriteExecutionPlan, AtomicWriteRequest,
};

/// Result of a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicWriteOutcome {
    /// The manifest entry as committed.
    pub manifest: ManifestEntry,
    /// Execution summary.
    pub report: AtomicWriteReport,
}

/// Manifest hooks that drive a [`ManifestRepository`] entry to `committed`.
struct RepositoryManifestHooks {
    manifests: Arc<dyn ManifestRepository>,
    manifest_id: i64,
    commit_tx_id: String,
}

#[async_trait]
impl ManifestHooks for RepositoryManifestHooks {
    async fn update_manifest(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        let entry = self
            .manifests
            .get_by_id(self.manifest_id)
            .await?
            .ok_or_else(|| {
                Error::manifest_invariant(format!(
                    "manifest {} disappeared before commit",
                    self.manifest_id
                ))
            })?;
        if entry.state != ManifestState::Pending {
            return Err(Error::manifest_invariant(format!(
                "manifest {} is {} and cannot be committed",
                entry.id, entry.state
            )));
        }
        Ok(())
    }

    async fn commit_transaction(&self, _plan: &AtomicWriteExecutionPlan) -> Result<()> {
        let committed = self
            .manifests
            .mark_committed(self.manifest_id, &self.commit_tx_id, Utc::now())
            .await?;
        match committed {
            Some(entry)
                if entry.state == ManifestState::Committed
                    && entry.commit_tx_id.as_deref() == Some(self.commit_tx_id.as_str()) =>
            {
                Ok(())
            }
            Some(entry) => Err(Error::manifest_invariant(format!(
                "manifest {} ended {} instead of committed by {}",
                entry.id, entry.state, self.commit_tx_id
            ))),
            None => Err(Error::manifest_invariant(format!(
                "manifest {} disappeared during commit",
                self.manifest_id
            ))),
        }
    }
}

/// Records, plans and executes atomic writes.
pub struct AtomicWriteService {
    manifests: Arc<dyn ManifestRepository>,
    executor: AtomicWriteExecutor,
}

impl std::fmt::Debug for AtomicWriteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicWriteService")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl AtomicWriteService {
    /// Creates a service.
    #[must_use]
    pub fn new(manifests: Arc<dyn ManifestRepository>, executor: AtomicWriteExecutor) -> Self {
        Self {
            manifests,
            executor,
        }
    }

    /// The manifest repository.
    #[must_use]
    pub fn manifests(&self) -> &Arc<dyn ManifestRepository> {
        &self.manifests
    }

    /// The executor.
    #[must_use]
    pub fn executor(&self) -> &AtomicWriteExecutor {
        &self.executor
    }

    /// Records a pending manifest entry and returns its plan, without executing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an invalid request, or a
    /// repository error.
    pub async fn prepare(&self, request: &AtomicWriteRequest) -> Result<AtomicWritePlan> {
        request.validate()?;
        let manifest = self
            .manifests
            .create_pending(new_manifest_entry(request, Utc::now()))
            .await?;
        debug!(manifest_id = manifest.id, target = %manifest.target_path, "manifest recorded");
        Ok(build_atomic_write_plan(manifest))
    }

    /// Performs one atomic write.
    ///
    /// On failure the manifest entry stays `pending` so that recovery can
    /// find the staging directory.
    ///
    /// # Errors
    ///
    /// Returns the first failure of validation, manifest creation, or
    /// execution, unchanged.
    pub async fn execute_atomic_write(
        &self,
        request: AtomicWriteRequest,
        hooks: &dyn AtomicWriteHooks,
    ) -> Result<AtomicWriteOutcome> {
        let plan = build_execution_plan(self.prepare(&request).await?);
        let manifest_id = plan.manifest.id;

        let manifest_hooks = RepositoryManifestHooks {
            manifests: Arc::clone(&self.manifests),
            manifest_id,
            commit_tx_id: Ulid::new().to_string(),
        };
        let report = self.executor.execute(&plan, hooks, &manifest_hooks).await?;

        let manifest = self
            .manifests
            .get_by_id(manifest_id)
            .await?
            .ok_or_else(|| Error::not_found("manifest", manifest_id))?;
        Ok(AtomicWriteOutcome { manifest, report })
    }
}
