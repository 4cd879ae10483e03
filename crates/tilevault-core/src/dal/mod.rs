//! Engine-agnostic database abstraction (DAL).
//!
//! The atomic-write subsystem never talks to a database engine directly. It
//! issues [`DalCommand`]s and [`DalQuery`]s through a [`DalConnection`] and
//! groups read-check-write sequences with
//! [`DalConnectionExt::run_in_transaction`].
//!
//! ## Engines
//!
//! - [`NoopDal`]: accepts every command, returns no rows (tests/tooling)
//! - [`SqliteDal`]: file-based, single writer, backed by `rusqlite`
//!
//! A client/server engine lives outside this crate and plugs in by
//! implementing [`DalConnection`].
//!
//! ## Transactions
//!
//! Work inside a transaction runs synchronously against a [`DalSession`].
//! Returning `Err` from the closure rolls the transaction back.
//!
//! ```rust,ignore
//! let holder = dal
//!     .run_in_transaction(|session| {
//!         let rows = session.execute_query(&DalQuery::new("SELECT owner FROM dal_locks"))?;
//!         Ok(rows.len())
//!     })
//!     .await?;
//! ```

pub mod handles;
pub mod noop;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use handles::{DalHandles, DalScope};
pub use noop::NoopDal;
pub use sqlite::SqliteDal;

/// A parameter or column value exchanged with an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DalValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl DalValue {
    /// Returns the value as text, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns true for `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for DalValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for DalValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for DalValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl<T: Into<DalValue>> From<Option<T>> for DalValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Kind of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DalCommandKind {
    /// Row insertion (reports the new row id).
    Insert,
    /// Row update.
    Update,
    /// Row deletion.
    Delete,
    /// Schema change.
    Ddl,
}

/// A mutating statement: `{type, text, parameters}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalCommand {
    /// Statement kind.
    #[serde(rename = "type")]
    pub kind: DalCommandKind,
    /// Statement text with positional `?N` placeholders.
    pub text: String,
    /// Positional parameters.
    pub parameters: Vec<DalValue>,
}

impl DalCommand {
    /// Creates a command without parameters.
    #[must_use]
    pub fn new(kind: DalCommandKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Appends a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<DalValue>) -> Self {
        self.parameters.push(value.into());
        self
    }
}

/// A read statement: `{text, parameters}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalQuery {
    /// Statement text with positional `?N` placeholders.
    pub text: String,
    /// Positional parameters.
    pub parameters: Vec<DalValue>,
}

impl DalQuery {
    /// Creates a query without parameters.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Appends a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<DalValue>) -> Self {
        self.parameters.push(value.into());
        self
    }
}

/// Outcome of a [`DalCommand`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Rows changed by the statement.
    pub rows_affected: u64,
    /// Id assigned to an inserted row, for [`DalCommandKind::Insert`].
    pub last_insert_id: Option<i64>,
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DalRow {
    columns: BTreeMap<String, DalValue>,
}

impl DalRow {
    /// Creates a row from `(column, value)` pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, DalValue)>) -> Self {
        Self {
            columns: pairs.into_iter().collect(),
        }
    }

    /// Returns the raw value of a column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&DalValue> {
        self.columns.get(column)
    }

    /// Returns a required text column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or not text.
    pub fn text(&self, column: &str) -> Result<&str> {
        self.get(column)
            .and_then(DalValue::as_text)
            .ok_or_else(|| Error::database(format!("column '{column}' is missing or not text")))
    }

    /// Returns an optional text column (`NULL` maps to `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if the column holds a non-text, non-null value.
    pub fn opt_text(&self, column: &str) -> Result<Option<&str>> {
        match self.get(column) {
            None | Some(DalValue::Null) => Ok(None),
            Some(DalValue::Text(s)) => Ok(Some(s)),
            Some(other) => Err(Error::database(format!(
                "column '{column}' is not text: {other:?}"
            ))),
        }
    }

    /// Returns a required integer column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or not an integer.
    pub fn integer(&self, column: &str) -> Result<i64> {
        self.get(column)
            .and_then(DalValue::as_integer)
            .ok_or_else(|| {
                Error::database(format!("column '{column}' is missing or not an integer"))
            })
    }
}

/// Synchronous statement execution, used inside a transaction.
pub trait DalSession {
    /// Executes a mutating statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the statement.
    fn execute_command(&mut self, command: &DalCommand) -> Result<CommandResult>;

    /// Executes a read statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the statement.
    fn execute_query(&mut self, query: &DalQuery) -> Result<Vec<DalRow>>;
}

/// Boxed unit of transactional work.
pub type TransactionWork = Box<dyn FnOnce(&mut dyn DalSession) -> Result<()> + Send + 'static>;

/// Engine identity, for logging and configuration checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DalEngine {
    /// [`NoopDal`].
    Noop,
    /// [`SqliteDal`].
    Sqlite,
    /// An engine supplied from outside this crate.
    External,
}

impl DalEngine {
    /// Returns the engine name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Sqlite => "sqlite",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for DalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DalEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noop" | "memory" => Ok(Self::Noop),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::Configuration(format!(
                "unsupported DAL engine '{other}' (expected noop or sqlite)"
            ))),
        }
    }
}

/// A connection to one logical database scope.
///
/// Implementations must be safe to share across tasks. Transactions must be
/// serializable with respect to other transactions on the same connection.
#[async_trait]
pub trait DalConnection: Send + Sync {
    /// Returns which engine backs this connection.
    fn engine(&self) -> DalEngine;

    /// Executes a mutating statement outside an explicit transaction.
    async fn execute_command(&self, command: DalCommand) -> Result<CommandResult>;

    /// Executes a read statement outside an explicit transaction.
    async fn execute_query(&self, query: DalQuery) -> Result<Vec<DalRow>>;

    /// Runs `work` inside one transaction, committing on `Ok` and rolling
    /// back on `Err`.
    async fn transaction(&self, work: TransactionWork) -> Result<()>;
}

/// Typed transaction helper available on every [`DalConnection`].
#[async_trait]
pub trait DalConnectionExt: DalConnection {
    /// Runs `work` in one transaction and returns its value.
    ///
    /// # Errors
    ///
    /// Returns the closure's error (after rollback) or an engine error.
    async fn run_in_transaction<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DalSession) -> Result<T> + Send + 'static;
}

#[async_trait]
impl<D: DalConnection + ?Sized> DalConnectionExt for D {
    async fn run_in_transaction<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DalSession) -> Result<T> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        self.transaction(Box::new(move |session: &mut dyn DalSession| {
            let value = work(session)?;
            *out.lock().map_err(|_| Error::internal("lock poisoned"))? = Some(value);
            Ok(())
        }))
        .await?;

        let value = slot
            .lock()
            .map_err(|_| Error::internal("lock poisoned"))?
            .take();
        value.ok_or_else(|| Error::database("transaction completed without a result"))
    }
}

/// Rejects anything but a plain SQL identifier (letters, digits, `_`).
///
/// Table names are interpolated into statement text, so they must never
/// come from untrusted input without passing through this check.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for an invalid identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "'{name}' is not a valid table identifier"
        )))
    }
}
