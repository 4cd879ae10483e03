//! In-memory manifest repository.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tilevault_core::error::{Error, Result};

use super::{ManifestEntry, ManifestRepository, ManifestState, NewManifestEntry};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    entries: BTreeMap<i64, ManifestEntry>,
}

/// Manifest repository held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryManifestRepository {
    inner: RwLock<Inner>,
}

fn poison_err() -> Error {
    Error::internal("manifest store poisoned")
}

impl InMemoryManifestRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        id: i64,
        apply: impl FnOnce(&ManifestEntry) -> Option<ManifestEntry>,
    ) -> Result<Option<ManifestEntry>> {
        let mut inner = self.inner.write().map_err(|_| poison_err())?;
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(next) = apply(entry) {
            *entry = next;
        }
        Ok(Some(entry.clone()))
    }
}

#[async_trait]
impl ManifestRepository for InMemoryManifestRepository {
    async fn create_pending(&self, entry: NewManifestEntry) -> Result<ManifestEntry> {
        let mut inner = self.inner.write().map_err(|_| poison_err())?;
        inner.next_id += 1;
        let id = inner.next_id;
        let created = ManifestEntry::pending(id, entry);
        inner.entries.insert(id, created.clone());
        Ok(created)
    }

    async fn mark_committed(
        &self,
        id: i64,
        commit_tx_id: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>> {
        self.transition(id, |entry| entry.committed(commit_tx_id, committed_at))
    }

    async fn mark_aborted(
        &self,
        id: i64,
        aborted_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>> {
        self.transition(id, |entry| entry.aborted(aborted_at))
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ManifestEntry>> {
        let inner = self.inner.read().map_err(|_| poison_err())?;
        Ok(inner.entries.get(&id).cloned())
    }

    async fn list_by_state(&self, state: ManifestState) -> Result<Vec<ManifestEntry>> {
        let inner = self.inner.read().map_err(|_| poison_err())?;
        Ok(inner
            .entries
            .values()
            .filter(|entry| entry.state == state)
            .cloned()
            .collect())
    }
}
