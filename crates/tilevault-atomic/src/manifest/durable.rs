//! Manifest repository persisted through the database abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::OnceCell;

use tilevault_core::dal::{
    validate_identifier, DalCommand, DalCommandKind, DalConnection, DalConnectionExt, DalQuery,
    DalRow, DalSession, DalValue,
};
use tilevault_core::error::{Error, Result};

use super::{ManifestEntry, ManifestRepository, ManifestState, NewManifestEntry};

/// Default manifest table.
pub const DEFAULT_MANIFEST_TABLE: &str = "atomic_write_manifests";

const COLUMNS: &str = "id, op_type, target_path, tmp_path, expected_files, author, \
                       created_at, state, committed_at, commit_tx_id";

/// Manifest repository backed by a DAL table.
pub struct DurableManifestRepository {
    dal: Arc<dyn DalConnection>,
    table: String,
    schema: OnceCell<()>,
}

impl std::fmt::Debug for DurableManifestRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableManifestRepository")
            .field("engine", &self.dal.engine())
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::database(format!("invalid manifest timestamp '{raw}': {e}")))
}

fn row_to_entry(row: &DalRow) -> Result<ManifestEntry> {
    Ok(ManifestEntry {
        id: row.integer("id")?,
        op_type: row.text("op_type")?.to_string(),
        target_path: row.text("target_path")?.to_string(),
        tmp_path: row.text("tmp_path")?.to_string(),
        expected_files: serde_json::from_str(row.text("expected_files")?)?,
        author: row.text("author")?.to_string(),
        created_at: parse_ts(row.text("created_at")?)?,
        state: row.text("state")?.parse()?,
        committed_at: row.opt_text("committed_at")?.map(parse_ts).transpose()?,
        commit_tx_id: row.opt_text("commit_tx_id")?.map(str::to_string),
    })
}

fn select_by_id(session: &mut dyn DalSession, table: &str, id: i64) -> Result<Option<ManifestEntry>> {
    let query = DalQuery::new(format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1")).bind(id);
    session
        .execute_query(&query)?
        .first()
        .map(row_to_entry)
        .transpose()
}

impl DurableManifestRepository {
    /// Creates a repository using the default table.
    #[must_use]
    pub fn new(dal: Arc<dyn DalConnection>) -> Self {
        Self {
            dal,
            table: DEFAULT_MANIFEST_TABLE.to_string(),
            schema: OnceCell::new(),
        }
    }

    /// Creates a repository using a custom table.
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

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     op_type TEXT NOT NULL, \
                     target_path TEXT NOT NULL, \
                     tmp_path TEXT NOT NULL, \
                     expected_files TEXT NOT NULL, \
                     author TEXT NOT NULL, \
                     created_at TEXT NOT NULL, \
                     state TEXT NOT NULL, \
                     committed_at TEXT, \
                     commit_tx_id TEXT)",
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

    /// Applies `to` to a pending row and returns the row as it stands afterwards.
    async fn transition(
        &self,
        id: i64,
        to: ManifestState,
        at: DateTime<Utc>,
        commit_tx_id: Option<String>,
    ) -> Result<Option<ManifestEntry>> {
        self.ensure_schema().await?;
        let table = self.table.clone();

        self.dal
            .run_in_transaction(move |session: &mut dyn DalSession| {
                let update = DalCommand::new(
                    DalCommandKind::Update,
                    format!(
                        "UPDATE {table} SET state = ?1, committed_at = ?2, commit_tx_id = ?3 \
                         WHERE id = ?4 AND state = ?5"
                    ),
                )
                .bind(to.as_str())
                .bind(format_ts(at))
                .bind(commit_tx_id.map_or(DalValue::Null, DalValue::from))
                .bind(id)
                .bind(ManifestState::Pending.as_str());
                session.execute_command(&update)?;
                select_by_id(session, &table, id)
            })
            .await
    }
}

#[async_trait]
impl ManifestRepository for DurableManifestRepository {
    async fn create_pending(&self, entry: NewManifestEntry) -> Result<ManifestEntry> {
        self.ensure_schema().await?;
        let table = self.table.clone();
        let expected_files = serde_json::to_string(&entry.expected_files)?;

        let id = {
            let entry = entry.clone();
            self.dal
                .run_in_transaction(move |session: &mut dyn DalSession| {
                    let insert = DalCommand::new(
                        DalCommandKind::Insert,
                        format!(
                            "INSERT INTO {table} \
                             (op_type, target_path, tmp_path, expected_files, author, created_at, state) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                        ),
                    )
                    .bind(entry.op_type)
                    .bind(entry.target_path)
                    .bind(entry.tmp_path)
                    .bind(expected_files)
                    .bind(entry.author)
                    .bind(format_ts(entry.created_at))
                    .bind(ManifestState::Pending.as_str());
                    session
                        .execute_command(&insert)?
                        .last_insert_id
                        .ok_or_else(|| Error::database("manifest insert returned no id"))
                })
                .await?
        };

        Ok(ManifestEntry::pending(id, entry))
    }

    async fn mark_committed(
        &self,
        id: i64,
        commit_tx_id: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>> {
        self.transition(
            id,
            ManifestState::Committed,
            committed_at,
            Some(commit_tx_id.to_string()),
        )
        .await
    }

    async fn mark_aborted(
        &self,
        id: i64,
        aborted_at: DateTime<Utc>,
    ) -> Result<Option<ManifestEntry>> {
        self.transition(id, ManifestState::Aborted, aborted_at, None)
            .await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ManifestEntry>> {
        self.ensure_schema().await?;
        let query =
            DalQuery::new(format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", self.table)).bind(id);
        self.dal
            .execute_query(query)
            .await?
            .first()
            .map(row_to_entry)
            .transpose()
    }

    async fn list_by_state(&self, state: ManifestState) -> Result<Vec<ManifestEntry>> {
        self.ensure_schema().await?;
        let query = DalQuery::new(format!(
            "SELECT {COLUMNS} FROM {} WHERE state = ?1 ORDER BY id",
            self.table
        ))
        .bind(state.as_str());
        self.dal
            .execute_query(query)
            .await?
            .iter()
            .map(row_to_entry)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ExpectedFile;
    use tilevault_core::dal::SqliteDal;

    fn repo() -> DurableManifestRepository {
        let dal: Arc<dyn DalConnection> = Arc::new(SqliteDal::open_in_memory().unwrap());
        DurableManifestRepository::new(dal)
    }

    fn new_entry() -> NewManifestEntry {
        NewManifestEntry {
            op_type: "tile_import".into(),
            target_path: "/maps/1/tiles/1".into(),
            tmp_path: "/maps/1/tmp/op-1".into(),
            expected_files: vec![
                ExpectedFile::new("a.png", "aa"),
                ExpectedFile::new("b/c.png", "bb"),
            ],
            author: "svc".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let repo = repo();
        let created = repo.create_pending(new_entry()).await.unwrap();
        assert_eq!(created.id, 1);
        assert_eq!(created.state, ManifestState::Pending);

        let loaded = repo.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(repo.get_by_id(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ids_increase() {
        let repo = repo();
        let a = repo.create_pending(new_entry()).await.unwrap();
        let b = repo.create_pending(new_entry()).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn commit_is_one_way() {
        let repo = repo();
        let created = repo.create_pending(new_entry()).await.unwrap();
        let at = Utc::now();

        let committed = repo
            .mark_committed(created.id, "tx-1", at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed.state, ManifestState::Committed);
        assert_eq!(committed.commit_tx_id.as_deref(), Some("tx-1"));
        assert_eq!(committed.committed_at, Some(at));

        let after_abort = repo.mark_aborted(created.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(after_abort, committed);

        assert!(repo.mark_committed(42, "tx", at).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_by_state_filters() {
        let repo = repo();
        let a = repo.create_pending(new_entry()).await.unwrap();
        let b = repo.create_pending(new_entry()).await.unwrap();
        repo.mark_aborted(a.id, Utc::now()).await.unwrap();

        let pending = repo.list_by_state(ManifestState::Pending).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id]);
        let aborted = repo.list_by_state(ManifestState::Aborted).await.unwrap();
        assert_eq!(aborted.len(), 1);
        assert!(aborted[0].commit_tx_id.is_none());
    }
}
