//! Pure derivation of atomic write plans.
//!
//! Nothing here touches the filesystem, a lock or a database; the same
//! manifest always yields the same plan.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tilevault_core::error::{Error, Result};
use tilevault_core::layout::LockKeys;

use crate::manifest::{ExpectedFile, ManifestEntry, NewManifestEntry};

/// A caller's request to write a set of files atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicWriteRequest {
    /// Kind of write (e.g. `tile_import`).
    pub op_type: String,
    /// Caller identity; also the lease owner.
    pub author: String,
    /// Final directory.
    pub target_path: String,
    /// Staging directory the files are written to first.
    pub tmp_dir: String,
    /// Files the write produces.
    pub expected_files: Vec<ExpectedFile>,
}

impl AtomicWriteRequest {
    /// Checks the request before anything is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty fields, a staging directory
    /// equal to the target, or an expected file path that is not a plain
    /// relative path.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("op_type", &self.op_type),
            ("author", &self.author),
            ("target_path", &self.target_path),
            ("tmp_dir", &self.tmp_dir),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{field} cannot be empty")));
            }
        }
        if Path::new(&self.tmp_dir) == Path::new(&self.target_path) {
            return Err(Error::InvalidInput(
                "tmp_dir must differ from target_path".into(),
            ));
        }
        for file in &self.expected_files {
            validate_relative_path(&file.relative_path)?;
        }
        Ok(())
    }
}

/// Rejects absolute paths and any `..` or root component.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `path` could escape its base directory.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    let plain = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if plain {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "'{path}' is not a plain relative path"
        )))
    }
}

/// Builds the pending manifest fields for `request`.
#[must_use]
pub fn new_manifest_entry(request: &AtomicWriteRequest, created_at: DateTime<Utc>) -> NewManifestEntry {
    NewManifestEntry {
        op_type: request.op_type.clone(),
        target_path: request.target_path.clone(),
        tmp_path: request.tmp_dir.clone(),
        expected_files: request.expected_files.clone(),
        author: request.author.clone(),
        created_at,
    }
}

/// One step of the atomic write sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicWriteStep {
    /// Take the write lease on the target.
    AcquireLock,
    /// Write every file into the staging directory.
    WriteFiles,
    /// Flush every staged file.
    FsyncFiles,
    /// Flush the staging directory entries.
    FsyncTmpDir,
    /// Move the staging directory onto the target.
    AtomicRename,
    /// Flush the target's parent directory.
    FsyncParentDir,
    /// Confirm the manifest row is ready to commit.
    UpdateManifest,
    /// Mark the manifest committed.
    CommitTx,
    /// Release the write lease.
    ReleaseLock,
}

impl AtomicWriteStep {
    /// All steps in execution order.
    pub const ALL: [Self; 9] = [
        Self::AcquireLock,
        Self::WriteFiles,
        Self::FsyncFiles,
        Self::FsyncTmpDir,
        Self::AtomicRename,
        Self::FsyncParentDir,
        Self::UpdateManifest,
        Self::CommitTx,
        Self::ReleaseLock,
    ];

    /// Returns the step name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AcquireLock => "acquire_lock",
            Self::WriteFiles => "write_files",
            Self::FsyncFiles => "fsync_files",
            Self::FsyncTmpDir => "fsync_tmp_dir",
            Self::AtomicRename => "atomic_rename",
            Self::FsyncParentDir => "fsync_parent_dir",
            Self::UpdateManifest => "update_manifest",
            Self::CommitTx => "commit_tx",
            Self::ReleaseLock => "release_lock",
        }
    }

    /// Returns a human-readable description.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::AcquireLock => "acquire the write lease on the target path",
            Self::WriteFiles => "write files into the staging directory",
            Self::FsyncFiles => "flush staged file contents to disk",
            Self::FsyncTmpDir => "flush the staging directory entries",
            Self::AtomicRename => "rename the staging directory onto the target",
            Self::FsyncParentDir => "flush the target's parent directory",
            Self::UpdateManifest => "verify the manifest entry is still pending",
            Self::CommitTx => "mark the manifest entry committed",
            Self::ReleaseLock => "release the write lease",
        }
    }
}

impl std::fmt::Display for AtomicWriteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step paired with its description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    /// The step.
    pub step: AtomicWriteStep,
    /// What the step does.
    pub description: &'static str,
}

/// Directories involved in one write.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicWritePlan {
    /// The pending manifest entry.
    pub manifest: ManifestEntry,
    /// Staging directory.
    pub tmp_dir: PathBuf,
    /// Final directory.
    pub final_dir: PathBuf,
    /// Parent of the final directory.
    pub final_parent_dir: PathBuf,
}

/// A plan plus its lease id and ordered steps.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicWriteExecutionPlan {
    /// The pending manifest entry.
    pub manifest: ManifestEntry,
    /// Staging directory.
    pub tmp_dir: PathBuf,
    /// Final directory.
    pub final_dir: PathBuf,
    /// Parent of the final directory.
    pub final_parent_dir: PathBuf,
    /// Lease id guarding the target.
    pub lock_id: String,
    /// The nine steps in execution order.
    pub steps: Vec<PlannedStep>,
}

impl AtomicWriteExecutionPlan {
    /// Target path as recorded in the manifest.
    #[must_use]
    pub fn target_path(&self) -> &str {
        &self.manifest.target_path
    }

    /// Caller identity; the lease owner.
    #[must_use]
    pub fn author(&self) -> &str {
        &self.manifest.author
    }

    /// Files the write produces.
    #[must_use]
    pub fn expected_files(&self) -> &[ExpectedFile] {
        &self.manifest.expected_files
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => path.to_path_buf(),
    }
}

/// Derives the directories for a manifest entry.
#[must_use]
pub fn build_atomic_write_plan(manifest: ManifestEntry) -> AtomicWritePlan {
    let tmp_dir = PathBuf::from(&manifest.tmp_path);
    let final_dir = PathBuf::from(&manifest.target_path);
    let final_parent_dir = parent_dir(&final_dir);
    AtomicWritePlan {
        manifest,
        tmp_dir,
        final_dir,
        final_parent_dir,
    }
}

/// Adds the lease id and the ordered step list to a plan.
#[must_use]
pub fn build_execution_plan(plan: AtomicWritePlan) -> AtomicWriteExecutionPlan {
    let lock_id = LockKeys::atomic(&plan.manifest.target_path);
    let steps = AtomicWriteStep::ALL
        .iter()
        .map(|&step| PlannedStep {
            step,
            description: step.description(),
        })
        .collect();
    AtomicWriteExecutionPlan {
        manifest: plan.manifest,
        tmp_dir: plan.tmp_dir,
        final_dir: plan.final_dir,
        final_parent_dir: plan.final_parent_dir,
        lock_id,
        steps,
    }
}
