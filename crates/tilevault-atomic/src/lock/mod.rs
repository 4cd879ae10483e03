//! Lease-based lock manager.
//!
//! Locks are named leases with three modes:
//! - **Read**: shared; any number of readers may hold the same id
//! - **Upgradeable**: shared with readers, exclusive against writers and
//!   other upgradeable holders
//! - **Write**: exclusive against everything
//!
//! `acquire` never blocks: a conflicting unexpired lease fails the call
//! immediately with [`Error::LockContention`]. Waiting happens only in
//! [`acquire_with_retry`]. A lease whose `lease_expires` has passed is
//! treated as free and is overwritten by the next acquirer.
//!
//! Only the lease owner may renew or release it; a mismatched owner is an
//! [`Error::LockOwnership`] in every backend.
//!
//! # Backends
//!
//! - [`InMemoryLockManager`]: process-local map (tests/tooling)
//! - [`DurableLockManager`]: transactional table reached through the DAL
//!
//! Both backends decide compatibility with the same function, so their
//! observable semantics are identical.
//!
//! # Example
//!
//! ```rust,ignore
//! let locks = create_lock_manager(LockBackendKind::Memory, None, LockManagerOptions::default())?;
//!
//! let lease = locks
//!     .acquire("map:p1:m1", "svc-a", LockType::Write, &AcquireOptions::default())
//!     .await?;
//! // ... exclusive section ...
//! locks.release(&lease).await?;
//! ```

pub mod diagnostics;
pub mod durable;
pub mod memory;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tilevault_core::config::{LockBackendKind, DEFAULT_LOCK_TABLE};
use tilevault_core::dal::DalConnection;
use tilevault_core::error::{Error, Result};

pub use diagnostics::{
    DiagnosedLockManager, LockDiagnosticEvent, LockDiagnosticsSink, LockOperation,
};
pub use durable::DurableLockManager;
pub use memory::InMemoryLockManager;
pub use retry::{acquire_with_retry, LockAcquisition, RetryPolicy};

/// Default lease duration (30 seconds).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Lease mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Shared lease.
    Read,
    /// Exclusive lease.
    Write,
    /// Shared with readers, exclusive against writers and other upgradeable holders.
    Upgradeable,
}

impl LockType {
    /// Returns the stored name of this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Upgradeable => "upgradeable",
        }
    }

    /// Returns whether a lease of this mode may coexist with `held`.
    #[must_use]
    pub const fn is_compatible_with(self, held: Self) -> bool {
        matches!(
            (self, held),
            (Self::Read, Self::Read | Self::Upgradeable) | (Self::Upgradeable, Self::Read)
        )
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LockType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "upgradeable" => Ok(Self::Upgradeable),
            other => Err(Error::InvalidInput(format!("unknown lock type '{other}'"))),
        }
    }
}

/// A live lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquiredLock {
    /// Lock identifier.
    pub id: String,
    /// Owner identity; the only caller allowed to renew or release.
    pub owner_id: String,
    /// Lease mode.
    #[serde(rename = "type")]
    pub lock_type: LockType,
    /// When the lease stops protecting the holder.
    pub lease_expires: DateTime<Utc>,
    /// Last acquisition or renewal time.
    pub heartbeat_ts: DateTime<Utc>,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AcquiredLock {
    /// Returns whether the lease had expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires
    }

    /// Returns whether the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns the remaining lease time, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        (self.lease_expires - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns the lease length granted at the last acquire/renew.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        (self.lease_expires - self.heartbeat_ts)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_LEASE_TTL)
    }
}

/// Options for a single acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOptions {
    /// Lease length.
    pub ttl: Duration,
    /// Metadata stored with the lease.
    pub metadata: Option<serde_json::Value>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LEASE_TTL,
            metadata: None,
        }
    }
}

impl AcquireOptions {
    /// Creates options with the given lease length.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Attaches metadata to the lease.
    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Lock manager contract shared by every backend.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempts to take a lease once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockContention`] if an unexpired incompatible lease
    /// exists, or a backend error.
    async fn acquire(
        &self,
        lock_id: &str,
        owner_id: &str,
        lock_type: LockType,
        options: &AcquireOptions,
    ) -> Result<AcquiredLock>;

    /// Extends a lease by its original length and refreshes its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockOwnership`] if another owner holds the id, or
    /// [`Error::LeaseNotHeld`] if the lease no longer exists.
    async fn renew(&self, lock: &AcquiredLock) -> Result<AcquiredLock>;

    /// Releases a lease.
    ///
    /// Releasing a lease that has already disappeared is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockOwnership`] if the id is held only by other owners.
    async fn release(&self, lock: &AcquiredLock) -> Result<()>;
}

/// Returns the first unexpired lease that conflicts with `requested`.
pub(crate) fn find_conflict<'a>(
    held: impl IntoIterator<Item = &'a AcquiredLock>,
    requested: LockType,
    now: DateTime<Utc>,
) -> Option<&'a AcquiredLock> {
    held.into_iter()
        .filter(|lease| !lease.is_expired_at(now))
        .find(|lease| !requested.is_compatible_with(lease.lock_type))
}

/// Builds the error for a renew/release that matched no lease of the caller.
pub(crate) fn not_held_error(lock: &AcquiredLock, other_owners_present: bool) -> Error {
    if other_owners_present {
        Error::LockOwnership {
            lock_id: lock.id.clone(),
            caller: lock.owner_id.clone(),
        }
    } else {
        Error::LeaseNotHeld {
            lock_id: lock.id.clone(),
            owner: lock.owner_id.clone(),
        }
    }
}

/// Current time truncated to milliseconds, the precision leases are stored at.
pub(crate) fn lease_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// Options for [`create_lock_manager`].
#[derive(Clone)]
pub struct LockManagerOptions {
    /// Table used by the durable backend.
    pub table: String,
    /// Sink notified of every acquire/renew/release attempt.
    pub diagnostics: Option<Arc<dyn LockDiagnosticsSink>>,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_LOCK_TABLE.to_string(),
            diagnostics: None,
        }
    }
}

impl std::fmt::Debug for LockManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManagerOptions")
            .field("table", &self.table)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

/// Builds a lock manager for the requested backend.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when the durable backend is requested
/// without a database connection or with an invalid table name.
pub fn create_lock_manager(
    kind: LockBackendKind,
    dal: Option<Arc<dyn DalConnection>>,
    options: LockManagerOptions,
) -> Result<Arc<dyn LockManager>> {
    let manager: Arc<dyn LockManager> = match kind {
        LockBackendKind::Memory => Arc::new(InMemoryLockManager::new()),
        LockBackendKind::Durable => {
            let dal = dal.ok_or_else(|| {
                Error::Configuration(
                    "durable lock backend requested without a database connection".into(),
                )
            })?;
            Arc::new(DurableLockManager::with_table(dal, options.table.clone())?)
        }
    };

    Ok(match options.diagnostics {
        Some(sink) => Arc::new(DiagnosedLockManager::new(manager, sink)),
        None => manager,
    })
}
