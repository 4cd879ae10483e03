//! Filesystem implementation of [`AtomicWriteHooks`].
//!
//! Files are staged under the plan's temporary directory, verified against
//! their expected SHA-256, flushed, then moved onto the target with a
//! single directory rename.
//!
//! An existing target is moved aside first and removed once the new
//! directory is in place. Before it moves, a `.<name>.replacing` marker
//! naming the displaced copy is written and flushed next to the target.
//! [`recover_displaced_target`] reads that marker after a crash and either
//! puts the old target back or discards the displaced copy. The hooks run
//! it before every rename, so the next write to a target heals it.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use ulid::Ulid;

use tilevault_core::error::{Error, Result};

use crate::hooks::AtomicWriteHooks;
use crate::manifest::ExpectedFile;
use crate::plan::{validate_relative_path, AtomicWriteExecutionPlan};

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A file to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Path relative to the staging directory.
    pub relative_path: String,
    /// File contents.
    pub contents: Bytes,
}

impl StagedFile {
    /// Creates a staged file.
    #[must_use]
    pub fn new(relative_path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            relative_path: relative_path.into(),
            contents: contents.into(),
        }
    }

    /// The manifest record for this file.
    #[must_use]
    pub fn expected(&self) -> ExpectedFile {
        ExpectedFile::new(self.relative_path.clone(), sha256_hex(&self.contents))
    }
}

/// Writes a fixed set of files through the real filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsAtomicWriteHooks {
    files: Vec<StagedFile>,
}

impl FsAtomicWriteHooks {
    /// Creates hooks that stage `files`.
    #[must_use]
    pub fn new(files: Vec<StagedFile>) -> Self {
        Self { files }
    }

    /// Manifest records for every staged file.
    #[must_use]
    pub fn expected_files(&self) -> Vec<ExpectedFile> {
        self.files.iter().map(StagedFile::expected).collect()
    }

    /// Directories under `tmp_dir` that received entries, deepest first.
    fn staged_dirs(&self, tmp_dir: &Path) -> Vec<PathBuf> {
        let mut dirs = BTreeSet::new();
        for file in &self.files {
            let mut current = tmp_dir.join(&file.relative_path);
            while let Some(parent) = current.parent() {
                if !parent.starts_with(tmp_dir) {
                    break;
                }
                dirs.insert(parent.to_path_buf());
                current = parent.to_path_buf();
            }
        }
        dirs.insert(tmp_dir.to_path_buf());
        dirs.into_iter().rev().collect()
    }
}

async fn sync_file(path: &Path) -> Result<()> {
    let file = fs::File::open(path)
        .await
        .map_err(|e| Error::io(path.display(), e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::io(path.display(), e))
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> Result<()> {
    sync_file(path).await
}

// Directory handles cannot be flushed on this platform.
#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// What [`recover_displaced_target`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplacedTargetRecovery {
    /// No interrupted replacement was recorded.
    Clean,
    /// The target was missing; the displaced copy was moved back.
    Restored,
    /// The target was in place; any displaced copy was removed.
    Discarded,
}

fn target_name(final_dir: &Path) -> Result<String> {
    final_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "target {} has no final path component",
                final_dir.display()
            ))
        })
}

fn target_parent(final_dir: &Path) -> &Path {
    final_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn marker_path(final_dir: &Path) -> Result<PathBuf> {
    let name = target_name(final_dir)?;
    Ok(target_parent(final_dir).join(format!(".{name}.replacing")))
}

async fn path_exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| Error::io(path.display(), e))
}

async fn clear_marker(marker: &Path, parent: &Path) -> Result<()> {
    fs::remove_file(marker)
        .await
        .map_err(|e| Error::io(marker.display(), e))?;
    sync_dir(parent).await
}

/// Moves an existing target aside, recording where it went first.
async fn displace_target(final_dir: &Path) -> Result<PathBuf> {
    let name = target_name(final_dir)?;
    let parent = target_parent(final_dir);
    let aside_name = format!(".{name}.replaced-{}", Ulid::new());
    let marker = marker_path(final_dir)?;

    fs::write(&marker, aside_name.as_bytes())
        .await
        .map_err(|e| Error::io(marker.display(), e))?;
    sync_file(&marker).await?;
    sync_dir(parent).await?;

    let aside = parent.join(aside_name);
    fs::rename(final_dir, &aside)
        .await
        .map_err(|e| Error::io(final_dir.display(), e))?;
    sync_dir(parent).await?;
    Ok(aside)
}

/// Finishes or rolls back a replacement of `final_dir` that was interrupted.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the marker does not name a displaced
/// copy of this target, [`Error::Internal`] if neither the target nor the
/// displaced copy exists, or an I/O error. The marker is kept on error.
pub async fn recover_displaced_target(final_dir: &Path) -> Result<DisplacedTargetRecovery> {
    let marker = marker_path(final_dir)?;
    let recorded = match fs::read_to_string(&marker).await {
        Ok(recorded) => recorded,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DisplacedTargetRecovery::Clean),
        Err(e) => return Err(Error::io(marker.display(), e)),
    };

    let name = target_name(final_dir)?;
    let aside_name = recorded.trim();
    if !aside_name.starts_with(&format!(".{name}.replaced-")) || aside_name.contains(['/', '\\'])
    {
        return Err(Error::InvalidInput(format!(
            "marker {} names an unexpected entry: {aside_name}",
            marker.display()
        )));
    }
    let parent = target_parent(final_dir);
    let aside = parent.join(aside_name);

    let outcome = if path_exists(final_dir).await? {
        if path_exists(&aside).await? {
            fs::remove_dir_all(&aside)
                .await
                .map_err(|e| Error::io(aside.display(), e))?;
        }
        DisplacedTargetRecovery::Discarded
    } else if path_exists(&aside).await? {
        fs::rename(&aside, final_dir)
            .await
            .map_err(|e| Error::io(aside.display(), e))?;
        DisplacedTargetRecovery::Restored
    } else {
        return Err(Error::internal(format!(
            "neither {} nor its displaced copy {} exists",
            final_dir.display(),
            aside.display()
        )));
    };

    clear_marker(&marker, parent).await?;
    warn!(target = %final_dir.display(), ?outcome, "recovered interrupted target replacement");
    Ok(outcome)
}

#[async_trait]
impl AtomicWriteHooks for FsAtomicWriteHooks {
    async fn write_files(&self, plan: &AtomicWriteExecutionPlan) -> Result<()> {
        fs::create_dir_all(&plan.tmp_dir)
            .await
            .map_err(|e| Error::io(plan.tmp_dir.display(), e))?;

        for file in &self.files {
            validate_relative_path(&file.relative_path)?;
            let path = plan.tmp_dir.join(&file.relative_path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::io(parent.display(), e))?;
            }
            fs::write(&path, &file.contents)
                .await
                .map_err(|e| Error::io(path.display(), e))?;
        }

        for expected in plan.expected_files() {
            let path = plan.tmp_dir.join(&expected.relative_path);
            let data = fs::read(&path)
                .await
                .map_err(|e| Error::io(path.display(), e))?;
            let actual = sha256_hex(&data);
            if !actual.eq_ignore_ascii_case(&expected.sha256) {
                return Err(Error::InvalidInput(format!(
                    "checksum mismatch for {}: expected {}, found {actual}",
                    expected.relative_path, expected.sha256
                )));
            }
        }
        debug!(files = self.files.len(), tmp_dir = %plan.tmp_dir.display(), "files staged");
        Ok(())
    }

    async fn fsync_files(&self, plan: &AtomicWriteExecutionPlan) -> Result<()> {
        for file in &self.files {
            sync_file(&plan.tmp_dir.join(&file.relative_path)).await?;
        }
        Ok(())
    }

    async fn fsync_tmp_dir(&self, plan: &AtomicWriteExecutionPlan) -> Result<()> {
        for dir in self.staged_dirs(&plan.tmp_dir) {
            sync_dir(&dir).await?;
        }
        Ok(())
    }

    async fn atomic_rename(&self, plan: &AtomicWriteExecutionPlan) -> Result<()> {
        fs::create_dir_all(&plan.final_parent_dir)
            .await
            .map_err(|e| Error::io(plan.final_parent_dir.display(), e))?;

        recover_displaced_target(&plan.final_dir).await?;

        let displaced = if path_exists(&plan.final_dir).await? {
            Some(displace_target(&plan.final_dir).await?)
        } else {
            None
        };

        if let Err(e) = fs::rename(&plan.tmp_dir, &plan.final_dir).await {
            if let Some(aside) = &displaced {
                if let Err(restore) = fs::rename(aside, &plan.final_dir).await {
                    warn!(tmp_dir = %plan.tmp_dir.display(), error = %e, "rename into place failed");
                    return Err(Error::io(aside.display(), restore));
                }
                clear_marker(&marker_path(&plan.final_dir)?, &plan.final_parent_dir).await?;
            }
            return Err(Error::io(plan.tmp_dir.display(), e));
        }

        if let Some(aside) = displaced {
            // On failure the marker stays so recovery removes the copy later.
            if let Err(e) = fs::remove_dir_all(&aside).await {
                warn!(aside = %aside.display(), error = %e, "could not remove displaced target");
                return Ok(());
            }
            clear_marker(&marker_path(&plan.final_dir)?, &plan.final_parent_dir).await?;
        }
        Ok(())
    }

    async fn fsync_parent_dir(&self, plan: &AtomicWriteExecutionPlan) -> Result<()> {
        sync_dir(&plan.final_parent_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn staged_dirs_are_deepest_first() {
        let hooks = FsAtomicWriteHooks::new(vec![
            StagedFile::new("0/0/0.png", &b"a"[..]),
            StagedFile::new("meta.json", &b"{}"[..]),
        ]);
        let dirs = hooks.staged_dirs(Path::new("/tmp/op"));
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/tmp/op/0/0"),
                PathBuf::from("/tmp/op/0"),
                PathBuf::from("/tmp/op"),
            ]
        );
    }

    async fn seed_target(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(dir.join("meta.json"), contents).await.unwrap();
    }

    async fn read_meta(dir: &Path) -> String {
        fs::read_to_string(dir.join("meta.json")).await.unwrap()
    }

    async fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut read = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = read.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn interrupted_replacement_restores_the_old_target() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("tiles");
        seed_target(&target, "old").await;

        // Stop after the old target moved aside, before the new one lands.
        let aside = displace_target(&target).await.unwrap();
        assert!(!target.exists());
        assert!(aside.exists());

        let outcome = recover_displaced_target(&target).await.unwrap();
        assert_eq!(outcome, DisplacedTargetRecovery::Restored);
        assert_eq!(read_meta(&target).await, "old");
        assert_eq!(entries(root.path()).await, vec!["tiles".to_string()]);
    }

    #[tokio::test]
    async fn interrupted_cleanup_keeps_the_new_target() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("tiles");
        let staged = root.path().join("staged");
        seed_target(&target, "old").await;
        seed_target(&staged, "new").await;

        // Stop after the new target landed, before the old copy is removed.
        displace_target(&target).await.unwrap();
        fs::rename(&staged, &target).await.unwrap();

        let outcome = recover_displaced_target(&target).await.unwrap();
        assert_eq!(outcome, DisplacedTargetRecovery::Discarded);
        assert_eq!(read_meta(&target).await, "new");
        assert_eq!(entries(root.path()).await, vec!["tiles".to_string()]);
    }

    #[tokio::test]
    async fn recovery_without_marker_is_clean() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("tiles");
        seed_target(&target, "old").await;

        let outcome = recover_displaced_target(&target).await.unwrap();
        assert_eq!(outcome, DisplacedTargetRecovery::Clean);
        assert_eq!(read_meta(&target).await, "old");
    }

    #[tokio::test]
    async fn marker_naming_another_entry_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("tiles");
        fs::write(root.path().join(".tiles.replacing"), "../elsewhere")
            .await
            .unwrap();

        let err = recover_displaced_target(&target).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "got {err:?}");
        assert!(root.path().join(".tiles.replacing").exists());
    }

    #[test]
    fn expected_files_carry_digests() {
        let hooks = FsAtomicWriteHooks::new(vec![StagedFile::new("a.txt", &b"abc"[..])]);
        let expected = hooks.expected_files();
        assert_eq!(expected[0].relative_path, "a.txt");
        assert_eq!(expected[0].sha256, sha256_hex(b"abc"));
    }
}
