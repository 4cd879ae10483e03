//! Lock manager persisted through the database abstraction.
//!
//! Leases live in one table (default `dal_locks`) keyed by
//! `(lock_id, owner)`. Every acquire/renew/release runs inside a single
//! DAL transaction, so the read-check-write sequence is atomic against
//! every other process sharing the database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::OnceCell;

use tilevault_core::config::DEFAULT_LOCK_TABLE;
use tilevault_core::dal::{
    validate_identifier, DalCommand, DalCommandKind, DalConnection, DalConnectionExt, DalQuery,
    DalRow, DalSession, DalValue,
};
use tilevault_core::error::{Error, Result};

use super::{
    find_conflict, lease_expiry, lease_now, not_held_error, AcquireOptions, AcquiredLock,
    LockManager, LockType,
};

/// Lock manager backed by a DAL table.
pub struct DurableLockManager {
    dal: Arc<dyn DalConnection>,
    table: String,
    schema: OnceCell<()>,
}

impl std::fmt::Debug for DurableLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLockManager")
            .field("engine", &self.dal.engine())
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl DurableLockManager {
    /// Creates a manager using the default `dal_locks` table.
    #[must_use]
    pub fn new(dal: Arc<dyn DalConnection>) -> Self {
        Self {
            dal,
            table: DEFAULT_LOCK_TABLE.to_string(),
            schema: OnceCell::new(),
        }
    }

    /// Creates a manager using a custom table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `table` is not a plain identifier.
    pub fn with_table(dal: Arc<dyn DalConnection>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            dal,
            table,
            schema: OnceCell::new(),
        })
    }

    /// Returns the lease table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     lock_id TEXT NOT NULL, \
                     owner TEXT NOT NULL, \
                     lease_expires TEXT NOT NULL, \
                     heartbeat_ts TEXT NOT NULL, \
                     metadata TEXT, \
                     \"type\" TEXT NOT NULL, \
                     PRIMARY KEY (lock_id, owner))",
                    self.table
                );
                self.dal
                    .execute_command(DalCommand::new(DalCommandKind::Ddl, ddl))
                    .await
                    .map(|_| ())
            })
            .await
            .map(|_| ())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::database(format!("invalid {column} timestamp '{raw}': {e}")))
}

fn row_to_lock(row: &DalRow) -> Result<AcquiredLock> {
    let metadata = row
        .opt_text("metadata")?
        .map(serde_json::from_str)
        .transpose()?;
    Ok(AcquiredLock {
        id: row.text("lock_id")?.to_string(),
        owner_id: row.text("owner")?.to_string(),
        lock_type: row.text("type")?.parse()?,
        lease_expires: parse_ts("lease_expires", row.text("lease_expires")?)?,
        heartbeat_ts: parse_ts("heartbeat_ts", row.text("heartbeat_ts")?)?,
        metadata,
    })
}

fn load_leases(session: &mut dyn DalSession, table: &str, lock_id: &str) -> Result<Vec<AcquiredLock>> {
    let query = DalQuery::new(format!(
        "SELECT lock_id, owner, lease_expires, heartbeat_ts, metadata, \"type\" \
         FROM {table} WHERE lock_id = ?1"
    ))
    .bind(lock_id);
    session
        .execute_query(&query)?
        .iter()
        .map(row_to_lock)
        .collect()
}

fn delete_lease(session: &mut dyn DalSession, table: &str, lock_id: &str, owner: &str) -> Result<u64> {
    let command = DalCommand::new(
        DalCommandKind::Delete,
        format!("DELETE FROM {table} WHERE lock_id = ?1 AND owner = ?2"),
    )
    .bind(lock_id)
    .bind(owner);
    Ok(session.execute_command(&command)?.rows_affected)
}

#[async_trait]
impl LockManager for DurableLockManager {
    async fn acquire(
        &self,
        lock_id: &str,
        owner_id: &str,
        lock_type: LockType,
        options: &AcquireOptions,
    ) -> Result<AcquiredLock> {
        self.ensure_schema().await?;

        let now = lease_now();
        let lock = AcquiredLock {
            id: lock_id.to_string(),
            owner_id: owner_id.to_string(),
            lock_type,
            lease_expires: lease_expiry(now, options.ttl),
            heartbeat_ts: now,
            metadata: options.metadata.clone(),
        };
        let metadata = lock
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let table = self.table.clone();
        let candidate = lock.clone();

        self.dal
            .run_in_transaction(move |session: &mut dyn DalSession| {
                let held = load_leases(session, &table, &candidate.id)?;
                for expired in held.iter().filter(|l| l.is_expired_at(now)) {
                    delete_lease(session, &table, &expired.id, &expired.owner_id)?;
                }

                if let Some(conflict) = find_conflict(held.iter(), candidate.lock_type, now) {
                    return Err(Error::LockContention {
                        lock_id: candidate.id.clone(),
                        holder: conflict.owner_id.clone(),
                        attempts: 1,
                    });
                }

                delete_lease(session, &table, &candidate.id, &candidate.owner_id)?;
                let insert = DalCommand::new(
                    DalCommandKind::Insert,
                    format!(
                        "INSERT INTO {table} \
                         (lock_id, owner, lease_expires, heartbeat_ts, metadata, \"type\") \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                )
                .bind(candidate.id.as_str())
                .bind(candidate.owner_id.as_str())
                .bind(format_ts(candidate.lease_expires))
                .bind(format_ts(candidate.heartbeat_ts))
                .bind(metadata.map_or(DalValue::Null, DalValue::from))
                .bind(candidate.lock_type.as_str());
                session.execute_command(&insert)?;
                Ok(())
            })
            .await?;

        Ok(lock)
    }

    async fn renew(&self, lock: &AcquiredLock) -> Result<AcquiredLock> {
        self.ensure_schema().await?;

        let now = lease_now();
        let expires = lease_expiry(now, lock.lease_duration());
        let table = self.table.clone();
        let caller = lock.clone();

        self.dal
            .run_in_transaction(move |session: &mut dyn DalSession| {
                let held = load_leases(session, &table, &caller.id)?;
                let Some(own) = held.iter().find(|l| l.owner_id == caller.owner_id) else {
                    return Err(not_held_error(&caller, !held.is_empty()));
                };

                let update = DalCommand::new(
                    DalCommandKind::Update,
                    format!(
                        "UPDATE {table} SET lease_expires = ?1, heartbeat_ts = ?2 \
                         WHERE lock_id = ?3 AND owner = ?4"
                    ),
                )
                .bind(format_ts(expires))
                .bind(format_ts(now))
                .bind(caller.id.as_str())
                .bind(caller.owner_id.as_str());
                session.execute_command(&update)?;

                Ok(AcquiredLock {
                    lease_expires: expires,
                    heartbeat_ts: now,
                    ..own.clone()
                })
            })
            .await
    }

    async fn release(&self, lock: &AcquiredLock) -> Result<()> {
        self.ensure_schema().await?;

        let table = self.table.clone();
        let caller = lock.clone();

        self.dal
            .run_in_transaction(move |session: &mut dyn DalSession| {
                let removed = delete_lease(session, &table, &caller.id, &caller.owner_id)?;
                if removed > 0 {
                    return Ok(());
                }
                let others = load_leases(session, &table, &caller.id)?;
                if others.is_empty() {
                    Ok(())
                } else {
                    Err(not_held_error(&caller, true))
                }
            })
            .await
    }
}
