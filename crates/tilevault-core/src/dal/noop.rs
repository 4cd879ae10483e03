//! In-memory no-op engine.
//!
//! Accepts every statement, changes nothing and returns no rows. Useful when
//! the lock manager and manifest repository run on their in-memory backends
//! and the DAL is only needed to satisfy wiring.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{
    CommandResult, DalCommand, DalConnection, DalEngine, DalQuery, DalRow, DalSession,
    TransactionWork,
};
use crate::error::Result;

/// A [`DalConnection`] that executes nothing.
#[derive(Debug, Default)]
pub struct NoopDal {
    statements: AtomicU64,
    transactions: AtomicU64,
}

impl NoopDal {
    /// Creates a new no-op engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements accepted so far (inside or outside transactions).
    #[must_use]
    pub fn statement_count(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    /// Number of transactions run so far.
    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }
}

struct NoopSession<'a> {
    statements: &'a AtomicU64,
}

impl DalSession for NoopSession<'_> {
    fn execute_command(&mut self, _command: &DalCommand) -> Result<CommandResult> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        Ok(CommandResult::default())
    }

    fn execute_query(&mut self, _query: &DalQuery) -> Result<Vec<DalRow>> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        Ok(Vec::new())
    }
}

#[async_trait]
impl DalConnection for NoopDal {
    fn engine(&self) -> DalEngine {
        DalEngine::Noop
    }

    async fn execute_command(&self, command: DalCommand) -> Result<CommandResult> {
        NoopSession {
            statements: &self.statements,
        }
        .execute_command(&command)
    }

    async fn execute_query(&self, query: DalQuery) -> Result<Vec<DalRow>> {
        NoopSession {
            statements: &self.statements,
        }
        .execute_query(&query)
    }

    async fn transaction(&self, work: TransactionWork) -> Result<()> {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        let mut session = NoopSession {
            statements: &self.statements,
        };
        work(&mut session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{DalCommandKind, DalConnectionExt};

    #[tokio::test]
    async fn accepts_everything_and_returns_nothing() {
        let dal = NoopDal::new();
        let result = dal
            .execute_command(DalCommand::new(DalCommandKind::Insert, "INSERT INTO t VALUES (1)"))
            .await
            .unwrap();
        assert_eq!(result, CommandResult::default());
        assert!(dal.execute_query(DalQuery::new("SELECT 1")).await.unwrap().is_empty());
        assert_eq!(dal.statement_count(), 2);
    }

    #[tokio::test]
    async fn transactions_return_closure_values() {
        let dal = NoopDal::new();
        let value = dal
            .run_in_transaction(|session| {
                session.execute_query(&DalQuery::new("SELECT 1"))?;
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(dal.transaction_count(), 1);
    }
}
