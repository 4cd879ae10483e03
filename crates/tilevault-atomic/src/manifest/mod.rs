//! Manifest log of atomic writes.
//!
//! Every write is recorded as a manifest entry before any file is touched.
//! Entries start `pending` and move exactly once, to `committed` or
//! `aborted`. A pending entry that outlives its process marks a temporary
//! directory that crash recovery must inspect.

pub mod durable;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tilevault_core::error::{Error, Result};

pub use durable::DurableManifestRepository;
pub use memory::InMemoryManifestRepository;

/// Manifest entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    /// Write in progress or interrupted.
    Pending,
    /// Files are live at the target path.
    Committed,
    /// Write abandoned.
    Aborted,
}

impl ManifestState {
    /// Returns the stored name of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    /// Returns whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ManifestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ManifestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            "aborted" => Ok(Self::Aborted),
            other => Err(Error::InvalidInput(format!(
                "unknown manifest state '{other}'"
            ))),
        }
    }
}

/// A file the write is expected to produce, relative to the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedFile {
    /// Path relative to the target (and temporary) directory.
    pub relative_path: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

impl ExpectedFile {
    /// Creates an expected file record.
    #[must_use]
    pub fn new(relative_path: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            sha256: sha256.into(),
        }
    }
}

/// Fields supplied when recording a new write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewManifestEntry {
    /// Kind of write (e.g. `tile_import`).
    pub op_type: String,
    /// Final directory.
    pub target_path: String,
    /// Staging directory.
    pub tmp_path: String,
    /// Files the write produces.
    pub expected_files: Vec<ExpectedFile>,
    /// Caller identity.
    pub author: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A recorded write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Repository-assigned identifier, increasing.
    pub id: i64,
    /// Kind of write.
    pub op_type: String,
    /// Final directory.
    pub target_path: String,
    /// Staging directory.
    pub tmp_path: String,
    /// Files the write produces.
    pub expected_files: Vec<ExpectedFile>,
    /// Caller identity.
    pub author: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: ManifestState,
    /// When the entry left `pending` (commit or abort time).
    pub committed_at: Option<DateTime<Utc>>,
    /// Transaction id of the commit; `None` unless committed.
    pub commit_tx_id: Option<String>,
}

impl ManifestEntry {
    /// Creates a pending entry from `new`.
    #[must_use]
    pub fn pending(id: i64, new: NewManifestEntry) -> Self {
        Self {
            id,
            op_type: new.op_type,
            target_path: new.target_path,
            tmp_path: new.tmp_path,
            expected_files: new.expected_files,
            author: new.author,
            created_at: new.created_at,
            state: ManifestState::Pending,
            committed_at: None,
            commit_tx_id: None,
        }
    }

    /// Returns the committed form of this entry, if it is still pending.
    #[must_use]
    pub fn committed(&self, commit_tx_id: &str, committed_at: DateTime<Utc>) -> Option<Self> {
        (self.state == ManifestState::Pending).then(|| Self {
            state: ManifestState::Committed,
            committed_at: Some(committed_at),
            commit_tx_id: Some(commit_tx_id.to_string()),
            ..self.clone()
        })
    }

    /// Returns the aborted form of this entry, if it is still pending.
    #[must_use]
    pub fn aborted(&self, aborted_at: DateTime<Utc>) -> Option<Self> {
        (self.state == ManifestState::Pending).then(|| Self {
            state: ManifestState::Aborted,
            committed_at: Some(aborted_at),
            commit_tx_id: None,
            ..self.clone()
        })
    }
}

/// Persistent store of manifest entries.
///
/// Transitions are one-way: `mark_committed` and `mark_aborted` only act on
/// pending entries. Calling either on a terminal entry returns the entry
/// unchanged, and on a missing id returns `None`.
#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Records a new pending entry and assigns its id.
    async fn create_pending(&self, entry: NewManifestEntry) -> Result<ManifestEntry>;

    /// Moves a pending entry to `committed`.
    async fn mark_committed(
        &self,
        id: i64,
        commit_tx_id: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>>;

    /// Moves a pending entry to `aborted`.
    async fn mark_aborted(
        &self,
        id: i64,
        aborted_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>>;

    /// Fetches one entry.
    async fn get_by_id(&self, id: i64) -> Result<Option<ManifestEntry>>;

    /// Lists entries in `state`, oldest id first.
    async fn list_by_state(&self, state: ManifestState) -> Result<Vec<ManifestEntry>>;
}

/// Returns pending entries created more than `older_than` before `now`.
///
/// These are the writes a recovery sweep should inspect.
///
/// # Errors
///
/// Returns any repository error.
pub async fn find_stale_pending(
    repo: &dyn ManifestRepository,
    now: DateTime<Utc>,
    older_than: Duration,
) -> Result<Vec<ManifestEntry>> {
    let threshold = chrono::Duration::from_std(older_than)
        .map_err(|e| Error::InvalidInput(format!("threshold out of range: {e}")))?;
    Ok(repo
        .list_by_state(ManifestState::Pending)
        .await?
        .into_iter()
        .filter(|entry| now - entry.created_at > threshold)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(created_at: DateTime<Utc>) -> NewManifestEntry {
        NewManifestEntry {
            op_type: "tile_import".into(),
            target_path: "/maps/1/tiles/1".into(),
            tmp_path: "/maps/1/tmp/op-1".into(),
            expected_files: vec![ExpectedFile::new("0/0/0.png", "ab")],
            author: "svc".into(),
            created_at,
        }
    }

    #[test]
    fn transitions_only_leave_pending() {
        let entry = ManifestEntry::pending(1, sample(Utc::now()));
        let committed = entry.committed("tx-1", Utc::now()).unwrap();
        assert_eq!(committed.state, ManifestState::Committed);
        assert_eq!(committed.commit_tx_id.as_deref(), Some("tx-1"));
        assert!(committed.committed("tx-2", Utc::now()).is_none());
        assert!(committed.aborted(Utc::now()).is_none());

        let aborted = entry.aborted(Utc::now()).unwrap();
        assert_eq!(aborted.state, ManifestState::Aborted);
        assert!(aborted.commit_tx_id.is_none());
        assert!(aborted.committed_at.is_some());
    }

    #[tokio::test]
    async fn stale_pending_excludes_recent_and_terminal_entries() {
        let repo = InMemoryManifestRepository::new();
        let now = Utc::now();
        let old = repo
            .create_pending(sample(now - chrono::Duration::hours(3)))
            .await
            .unwrap();
        repo.create_pending(sample(now)).await.unwrap();
        let done = repo
            .create_pending(sample(now - chrono::Duration::hours(3)))
            .await
            .unwrap();
        repo.mark_committed(done.id, "tx", now).await.unwrap();

        let stale = find_stale_pending(&repo, now, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(stale.iter().map(|e| e.id).collect::<Vec<_>>(), vec![old.id]);
    }

    #[test]
    fn entry_serializes_in_camel_case() {
        let entry = ManifestEntry::pending(7, sample(Utc::now()));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["opType"], "tile_import");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["expectedFiles"][0]["relativePath"], "0/0/0.png");
    }
}
