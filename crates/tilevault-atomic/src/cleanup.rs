//! Planning which staging directories are safe to delete.
//!
//! The planner only classifies; a separate sweeper acts on the result. Any
//! uncertainty about a directory keeps it.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{ManifestEntry, ManifestState};

/// Default safety window (24 hours).
pub const DEFAULT_SAFETY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// What is known about one staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmpDirectoryInfo {
    /// Directory path.
    pub path: PathBuf,
    /// Manifest entry that created it, if known.
    pub manifest_id: Option<i64>,
    /// State of that entry, if known.
    pub manifest_state: Option<ManifestState>,
    /// Creation time as recorded (RFC 3339), if known.
    pub created_at: Option<String>,
}

impl TmpDirectoryInfo {
    /// Describes the staging directory of a manifest entry.
    #[must_use]
    pub fn from_manifest(entry: &ManifestEntry) -> Self {
        Self {
            path: PathBuf::from(&entry.tmp_path),
            manifest_id: Some(entry.id),
            manifest_state: Some(entry.state),
            created_at: Some(entry.created_at.to_rfc3339()),
        }
    }
}

/// Why a directory was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    /// The write may still be in progress or awaiting recovery.
    Pending,
    /// No creation time recorded.
    MissingCreatedAt,
    /// Creation time could not be parsed.
    InvalidCreatedAt,
    /// Younger than the safety window.
    WithinSafetyWindow,
}

/// A directory the sweeper must leave alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeptTmpDirectory {
    /// The directory.
    pub info: TmpDirectoryInfo,
    /// Why it is kept.
    pub reason: KeepReason,
}

/// Cleanup recommendation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCleanupPlan {
    /// Number of directories examined.
    pub considered: usize,
    /// Directories safe to delete.
    pub to_delete: Vec<TmpDirectoryInfo>,
    /// Directories to keep.
    pub to_keep: Vec<KeptTmpDirectory>,
}

/// Safety window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Minimum age before a finished directory may be deleted.
    pub safety_window: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            safety_window: DEFAULT_SAFETY_WINDOW,
        }
    }
}

impl CleanupPolicy {
    /// Short window for development environments (1 hour).
    #[must_use]
    pub fn development() -> Self {
        Self {
            safety_window: Duration::from_secs(60 * 60),
        }
    }

    /// Plans cleanup with this policy's window.
    #[must_use]
    pub fn plan(&self, now: DateTime<Utc>, infos: Vec<TmpDirectoryInfo>) -> ManifestCleanupPlan {
        build_manifest_cleanup_plan(now, self.safety_window, infos)
    }
}

fn keep_reason(
    info: &TmpDirectoryInfo,
    now: DateTime<Utc>,
    safety_window: Option<chrono::Duration>,
) -> Option<KeepReason> {
    if info.manifest_state == Some(ManifestState::Pending) {
        return Some(KeepReason::Pending);
    }
    let Some(raw) = info.created_at.as_deref() else {
        return Some(KeepReason::MissingCreatedAt);
    };
    let Ok(created_at) = DateTime::parse_from_rfc3339(raw) else {
        return Some(KeepReason::InvalidCreatedAt);
    };
    match safety_window {
        Some(window) if now.signed_duration_since(created_at) > window => None,
        _ => Some(KeepReason::WithinSafetyWindow),
    }
}

/// Classifies staging directories into delete and keep sets.
///
/// A directory is deletable only if its manifest is not pending, it has a
/// parseable creation time, and it is older than `safety_window`.
#[must_use]
pub fn build_manifest_cleanup_plan(
    now: DateTime<Utc>,
    safety_window: Duration,
    infos: Vec<TmpDirectoryInfo>,
) -> ManifestCleanupPlan {
    // A window too large to represent keeps everything.
    let window = chrono::Duration::from_std(safety_window).ok();
    let mut plan = ManifestCleanupPlan {
        considered: infos.len(),
        ..ManifestCleanupPlan::default()
    };

    for info in infos {
        match keep_reason(&info, now, window) {
            Some(reason) => plan.to_keep.push(KeptTmpDirectory { info, reason }),
            None => plan.to_delete.push(info),
        }
    }
    plan
}
