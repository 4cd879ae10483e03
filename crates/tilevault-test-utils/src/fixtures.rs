//! Pre-built test fixtures for common test scenarios.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use ulid::Ulid;

use tilevault_atomic::manifest::ExpectedFile;
use tilevault_atomic::plan::AtomicWriteRequest;
use tilevault_atomic::subsystem::{AtomicWriteSubsystem, SubsystemOptions};
use tilevault_core::config::{Config, LockBackendKind, LockRetryConfig};
use tilevault_core::dal::{DalEngine, DalHandles};
use tilevault_core::layout::StorageLayout;

/// Test context with a temporary storage root and a wired subsystem.
pub struct TestContext {
    /// Temporary storage root; removed on drop.
    pub root: TempDir,
    /// Configuration used to build the subsystem.
    pub config: Config,
    /// The subsystem under test.
    pub subsystem: AtomicWriteSubsystem,
}

/// Retry budget short enough to keep contention tests fast.
pub fn fast_retry() -> LockRetryConfig {
    LockRetryConfig {
        max_attempts: 3,
        initial_delay_ms: 5,
        max_delay_ms: 20,
    }
}

impl TestContext {
    /// In-memory locks and manifests.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// SQLite-backed durable locks and manifests.
    #[must_use]
    pub fn sqlite() -> Self {
        Self::with_config(|config| {
            config.dal_engine = DalEngine::Sqlite;
            config.lock_backend = LockBackendKind::Durable;
        })
    }

    /// Builds a context after applying `customize` to the default test config.
    #[must_use]
    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        Self::with_options(customize, SubsystemOptions::default())
    }

    /// Builds a context with extra subsystem collaborators.
    #[must_use]
    pub fn with_options(customize: impl FnOnce(&mut Config), options: SubsystemOptions) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let mut config = Config {
            storage_root: root.path().to_path_buf(),
            lock_retry: fast_retry(),
            ..Config::default()
        };
        customize(&mut config);

        let handles = DalHandles::new(StorageLayout::new(&config.storage_root), config.dal_engine)
            .expect("dal handles");
        let subsystem = AtomicWriteSubsystem::build(&config, handles, options).expect("subsystem");
        Self {
            root,
            config,
            subsystem,
        }
    }

    /// The storage root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// A fresh staging directory path (not created).
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.path().join("tmp").join(Ulid::new().to_string())
    }

    /// A request targeting `target` (relative to the root) with no files.
    #[must_use]
    pub fn request(&self, target: &str) -> AtomicWriteRequest {
        self.request_with_files(target, Vec::new())
    }

    /// A request targeting `target` (relative to the root).
    #[must_use]
    pub fn request_with_files(
        &self,
        target: &str,
        expected_files: Vec<ExpectedFile>,
    ) -> AtomicWriteRequest {
        AtomicWriteRequest {
            op_type: "tile_import".to_string(),
            author: "test-writer".to_string(),
            target_path: self.path().join(target).display().to_string(),
            tmp_dir: self.tmp_dir().display().to_string(),
            expected_files,
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
