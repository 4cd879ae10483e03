//! # tilevault-atomic
//!
//! Crash-safe atomic writes for tilevault storage.
//!
//! A write stages its files in a temporary directory and becomes visible
//! through a single directory rename, while a lease on the target keeps
//! concurrent writers out and a manifest log records every attempt:
//!
//! - **Locks**: Lease-based read/write/upgradeable locks, in memory or in
//!   a database table, with bounded retry
//! - **Manifest**: Pending/committed/aborted log of every write
//! - **Plans**: Pure derivation of directories and the nine-step sequence
//! - **Executor and service**: Ordered execution with guaranteed lease
//!   release, driven by caller-supplied hooks
//! - **Cleanup and diagnostics**: Conservative tmp-directory cleanup plans
//!   and a bounded history of executions
//!
//! ## Example
//!
//! ```rust,no_run
//! use tilevault_atomic::prelude::*;
//! use tilevault_core::Config;
//!
//! # async fn run() -> tilevault_core::Result<()> {
//! let subsystem = AtomicWriteSubsystem::from_config(&Config::default())?;
//!
//! let hooks = FsAtomicWriteHooks::new(vec![StagedFile::new("0/0/0.png", &b"tile"[..])]);
//! let request = AtomicWriteRequest {
//!     op_type: "tile_import".into(),
//!     author: "importer".into(),
//!     target_path: "/srv/tiles/basemap".into(),
//!     tmp_dir: "/srv/tiles/.tmp/import-1".into(),
//!     expected_files: hooks.expected_files(),
//! };
//!
//! let outcome = subsystem.execute_atomic_write(request, &hooks).await?;
//! assert_eq!(outcome.manifest.state, ManifestState::Committed);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cleanup;
pub mod diagnostics;
pub mod executor;
pub mod fs_hooks;
pub mod hooks;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod plan;
pub mod service;
pub mod subsystem;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cleanup::{
        build_manifest_cleanup_plan, CleanupPolicy, KeepReason, ManifestCleanupPlan,
        TmpDirectoryInfo,
    };
    pub use crate::diagnostics::{
        AtomicWriteDiagnostics, DiagnosticsRepository, DiagnosticsSink, OperationStatus,
    };
    pub use crate::executor::{AtomicWriteExecutor, AtomicWriteReport, ExecutorOptions};
    pub use crate::fs_hooks::{
        recover_displaced_target, DisplacedTargetRecovery, FsAtomicWriteHooks, StagedFile,
    };
    pub use crate::hooks::{AtomicWriteHooks, ManifestHooks};
    pub use crate::lock::{
        acquire_with_retry, create_lock_manager, AcquireOptions, AcquiredLock,
        DiagnosedLockManager, DurableLockManager, InMemoryLockManager, LockAcquisition,
        LockDiagnosticsSink, LockManager, LockManagerOptions, LockType, RetryPolicy,
    };
    pub use crate::manifest::{
        ExpectedFile, InMemoryManifestRepository, DurableManifestRepository, ManifestEntry,
        ManifestRepository, ManifestState, NewManifestEntry,
    };
    pub use crate::plan::{
        build_atomic_write_plan, build_execution_plan, AtomicWriteExecutionPlan,
        AtomicWritePlan, AtomicWriteRequest, AtomicWriteStep,
    };
    pub use crate::service::{AtomicWriteOutcome, AtomicWriteService};
    pub use crate::subsystem::{AtomicWriteSubsystem, SubsystemOptions};
}

// Re-export key types at crate root for ergonomics
pub use executor::AtomicWriteExecutor;
pub use lock::{AcquiredLock, LockManager, LockType};
pub use manifest::{ManifestEntry, ManifestRepository, ManifestState};
pub use plan::{AtomicWriteRequest, AtomicWriteStep};
pub use service::{AtomicWriteOutcome, AtomicWriteService};
pub use subsystem::AtomicWriteSubsystem;
