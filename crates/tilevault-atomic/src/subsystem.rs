//! Wiring of the atomic-write subsystem from configuration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use ulid::Ulid;

use tilevault_core::config::Config;
use tilevault_core::dal::{DalEngine, DalHandles};
use tilevault_core::error::Result;
use tilevault_core::id::{MapId, ProjectId};
use tilevault_core::layout::StorageLayout;

use crate::cleanup::{build_manifest_cleanup_plan, ManifestCleanupPlan, TmpDirectoryInfo};
use crate::diagnostics::{DiagnosticsRepository, DiagnosticsSink};
use crate::executor::{AtomicWriteExecutor, ExecutorOptions};
use crate::hooks::AtomicWriteHooks;
use crate::lock::{create_lock_manager, LockDiagnosticsSink, LockManager, LockManagerOptions, RetryPolicy};
use crate::manifest::{
    DurableManifestRepository, ExpectedFile, InMemoryManifestRepository, ManifestRepository,
    ManifestState,
};
use crate::plan::AtomicWriteRequest;
use crate::service::{AtomicWriteOutcome, AtomicWriteService};

/// Optional collaborators for [`AtomicWriteSubsystem::build`].
#[derive(Default, Clone)]
pub struct SubsystemOptions {
    /// Sink notified of every lock manager call.
    pub lock_diagnostics: Option<Arc<dyn LockDiagnosticsSink>>,
}

/// A fully wired lock manager, manifest repository, executor and service.
pub struct AtomicWriteSubsystem {
    config: Config,
    handles: Arc<DalHandles>,
    locks: Arc<dyn LockManager>,
    manifests: Arc<dyn ManifestRepository>,
    diagnostics: Arc<DiagnosticsRepository>,
    service: AtomicWriteService,
}

impl std::fmt::Debug for AtomicWriteSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicWriteSubsystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AtomicWriteSubsystem {
    /// Builds the subsystem for one of the built-in DAL engines.
    ///
    /// # Errors
    ///
    /// Returns [`tilevault_core::Error::Configuration`] for an invalid
    /// configuration, or an error opening the core database.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let handles = DalHandles::new(StorageLayout::new(&config.storage_root), config.dal_engine)?;
        Self::build(config, handles, SubsystemOptions::default())
    }

    /// Builds the subsystem over caller-supplied DAL handles.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or if the core
    /// database cannot be opened.
    pub fn build(config: &Config, handles: DalHandles, options: SubsystemOptions) -> Result<Self> {
        config.validate()?;
        let handles = Arc::new(handles);
        let durable = handles.engine() != DalEngine::Noop;
        let core = if durable { Some(handles.core()?) } else { None };

        let locks = create_lock_manager(
            config.lock_backend,
            core.clone(),
            LockManagerOptions {
                table: config.lock_table.clone(),
                diagnostics: options.lock_diagnostics,
            },
        )?;
        let manifests: Arc<dyn ManifestRepository> = match core {
            Some(dal) => Arc::new(DurableManifestRepository::new(dal)),
            None => Arc::new(InMemoryManifestRepository::new()),
        };
        let diagnostics = Arc::new(DiagnosticsRepository::new(config.diagnostics_capacity));

        let executor = AtomicWriteExecutor::new(
            Arc::clone(&locks),
            ExecutorOptions {
                lease_ttl: config.lease_ttl(),
                retry: RetryPolicy::from(&config.lock_retry),
            },
        )
        .with_diagnostics(Arc::clone(&diagnostics) as Arc<dyn DiagnosticsSink>);
        let service = AtomicWriteService::new(Arc::clone(&manifests), executor);

        info!(
            engine = %handles.engine(),
            lock_backend = ?config.lock_backend,
            root = %config.storage_root.display(),
            "atomic write subsystem ready"
        );

        Ok(Self {
            config: config.clone(),
            handles,
            locks,
            manifests,
            diagnostics,
            service,
        })
    }

    /// The configuration the subsystem was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Per-scope database handles.
    #[must_use]
    pub fn handles(&self) -> &Arc<DalHandles> {
        &self.handles
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// The manifest repository.
    #[must_use]
    pub fn manifests(&self) -> &Arc<dyn ManifestRepository> {
        &self.manifests
    }

    /// Recent execution diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<DiagnosticsRepository> {
        &self.diagnostics
    }

    /// The atomic write service.
    #[must_use]
    pub fn service(&self) -> &AtomicWriteService {
        &self.service
    }

    /// Builds a request that replaces a map's tiles directory, staged in a
    /// fresh directory under the map's tmp root.
    #[must_use]
    pub fn map_tiles_request(
        &self,
        project: &ProjectId,
        map: &MapId,
        op_type: &str,
        author: &str,
        expected_files: Vec<ExpectedFile>,
    ) -> AtomicWriteRequest {
        let layout = self.handles.layout();
        let tmp_dir = layout.map_operation_tmp_dir(project, map, &format!("{op_type}-{}", Ulid::new()));
        AtomicWriteRequest {
            op_type: op_type.to_string(),
            author: author.to_string(),
            target_path: layout.map_tiles_root(project, map).display().to_string(),
            tmp_dir: tmp_dir.display().to_string(),
            expected_files,
        }
    }

    /// Performs one atomic write through the service.
    ///
    /// # Errors
    ///
    /// See [`AtomicWriteService::execute_atomic_write`].
    pub async fn execute_atomic_write(
        &self,
        request: AtomicWriteRequest,
        hooks: &dyn AtomicWriteHooks,
    ) -> Result<AtomicWriteOutcome> {
        self.service.execute_atomic_write(request, hooks).await
    }

    /// Plans cleanup of every staging directory the manifest log knows about.
    ///
    /// # Errors
    ///
    /// Returns any repository error.
    pub async fn plan_manifest_cleanup(&self, now: DateTime<Utc>) -> Result<ManifestCleanupPlan> {
        let mut infos: Vec<TmpDirectoryInfo> = Vec::new();
        for state in [
            ManifestState::Pending,
            ManifestState::Committed,
            ManifestState::Aborted,
        ] {
            infos.extend(
                self.manifests
                    .list_by_state(state)
                    .await?
                    .iter()
                    .map(TmpDirectoryInfo::from_manifest),
            );
        }
        Ok(build_manifest_cleanup_plan(
            now,
            self.config.cleanup_safety_window(),
            infos,
        ))
    }
}
