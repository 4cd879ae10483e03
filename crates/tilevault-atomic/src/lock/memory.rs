//! Process-local lock manager.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use tilevault_core::error::{Error, Result};

use super::{
    find_conflict, lease_expiry, lease_now, not_held_error, AcquireOptions, AcquiredLock,
    LockManager, LockType,
};

/// Lock manager backed by an in-process map.
///
/// Leases are lost on restart. Suitable for tests, single-process tooling
/// and deployments without a database.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<String, Vec<AcquiredLock>>>,
}

fn poison_err() -> Error {
    Error::internal("lock table poisoned")
}

impl InMemoryLockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unexpired leases currently recorded for `lock_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal table is poisoned.
    pub fn active_leases(&self, lock_id: &str) -> Result<Vec<AcquiredLock>> {
        let now = lease_now();
        let leases = self.leases.lock().map_err(|_| poison_err())?;
        Ok(leases
            .get(lock_id)
            .map(|held| {
                held.iter()
                    .filter(|lease| !lease.is_expired_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        lock_id: &str,
        owner_id: &str,
        lock_type: LockType,
        options: &AcquireOptions,
    ) -> Result<AcquiredLock> {
        let now = lease_now();
        let mut leases = self.leases.lock().map_err(|_| poison_err())?;
        let held = leases.entry(lock_id.to_string()).or_default();
        held.retain(|lease| !lease.is_expired_at(now));

        if let Some(conflict) = find_conflict(held.iter(), lock_type, now) {
            return Err(Error::LockContention {
                lock_id: lock_id.to_string(),
                holder: conflict.owner_id.clone(),
                attempts: 1,
            });
        }

        let lock = AcquiredLock {
            id: lock_id.to_string(),
            owner_id: owner_id.to_string(),
            lock_type,
            lease_expires: lease_expiry(now, options.ttl),
            heartbeat_ts: now,
            metadata: options.metadata.clone(),
        };
        held.retain(|lease| lease.owner_id != owner_id);
        held.push(lock.clone());
        Ok(lock)
    }

    async fn renew(&self, lock: &AcquiredLock) -> Result<AcquiredLock> {
        let now = lease_now();
        let ttl = lock.lease_duration();
        let mut leases = self.leases.lock().map_err(|_| poison_err())?;
        let held = leases.get_mut(&lock.id);

        let Some(held) = held else {
            return Err(not_held_error(lock, false));
        };
        match held.iter().position(|l| l.owner_id == lock.owner_id) {
            Some(index) => {
                let own = &mut held[index];
                own.lease_expires = lease_expiry(now, ttl);
                own.heartbeat_ts = now;
                Ok(own.clone())
            }
            None => Err(not_held_error(lock, !held.is_empty())),
        }
    }

    async fn release(&self, lock: &AcquiredLock) -> Result<()> {
        let mut leases = self.leases.lock().map_err(|_| poison_err())?;
        let Some(held) = leases.get_mut(&lock.id) else {
            return Ok(());
        };

        let before = held.len();
        held.retain(|l| l.owner_id != lock.owner_id);
        let removed = held.len() < before;
        let others_remain = !held.is_empty();
        if held.is_empty() {
            leases.remove(&lock.id);
        }

        if !removed && others_remain {
            return Err(not_held_error(lock, true));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_lease_is_exclusive() {
        let locks = InMemoryLockManager::new();
        let opts = AcquireOptions::default();

        let lease = locks.acquire("x", "a", LockType::Write, &opts).await.unwrap();
        let err = locks.acquire("x", "b", LockType::Write, &opts).await.unwrap_err();
        assert!(matches!(err, Error::LockContention { ref holder, .. } if holder == "a"));

        locks.release(&lease).await.unwrap();
        locks.acquire("x", "b", LockType::Write, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn readers_share_and_block_writers() {
        let locks = InMemoryLockManager::new();
        let opts = AcquireOptions::default();

        locks.acquire("x", "r1", LockType::Read, &opts).await.unwrap();
        locks.acquire("x", "r2", LockType::Read, &opts).await.unwrap();
        locks.acquire("x", "u1", LockType::Upgradeable, &opts).await.unwrap();
        assert_eq!(locks.active_leases("x").unwrap().len(), 3);

        assert!(locks.acquire("x", "w", LockType::Write, &opts).await.is_err());
        assert!(locks.acquire("x", "u2", LockType::Upgradeable, &opts).await.is_err());
    }

    #[tokio::test]
    async fn expired_lease_is_overwritten() {
        let locks = InMemoryLockManager::new();
        let short = AcquireOptions::with_ttl(Duration::from_millis(20));

        locks.acquire("x", "a", LockType::Write, &short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let lease = locks
            .acquire("x", "b", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(lease.owner_id, "b");
        assert_eq!(locks.active_leases("x").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_owner_cannot_renew_or_release() {
        let locks = InMemoryLockManager::new();
        let lease = locks
            .acquire("x", "a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let mut forged = lease.clone();
        forged.owner_id = "b".into();
        assert!(matches!(
            locks.renew(&forged).await.unwrap_err(),
            Error::LockOwnership { .. }
        ));
        assert!(matches!(
            locks.release(&forged).await.unwrap_err(),
            Error::LockOwnership { .. }
        ));

        assert_eq!(locks.active_leases("x").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let locks = InMemoryLockManager::new();
        let lease = locks
            .acquire("x", "a", LockType::Write, &AcquireOptions::with_ttl(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let renewed = locks.renew(&lease).await.unwrap();
        assert!(renewed.lease_expires > lease.lease_expires);
        assert!(renewed.heartbeat_ts > lease.heartbeat_ts);
        assert_eq!(renewed.lease_duration(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn renew_after_release_reports_missing_lease() {
        let locks = InMemoryLockManager::new();
        let lease = locks
            .acquire("x", "a", LockType::Read, &AcquireOptions::default())
            .await
            .unwrap();
        locks.release(&lease).await.unwrap();

        assert!(matches!(
            locks.renew(&lease).await.unwrap_err(),
            Error::LeaseNotHeld { .. }
        ));
        // Releasing twice is harmless.
        locks.release(&lease).await.unwrap();
    }
}
