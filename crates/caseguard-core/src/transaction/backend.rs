//! Transaction Backend Trait - abstraction boundary for storage transactions.
//!
//! The storage engine supplies transactions with the four SQL isolation levels
//! and a per-transaction statement timeout.

use std::time::Duration;

use super::isolation::IsolationLevel;
use crate::Result;

#[async_trait::async_trait]
pub trait TransactionBackend: Send + Sync {
    /// Open a transaction at `isolation` with `statement_timeout` applied.
    async fn begin(
        &self,
        isolation: IsolationLevel,
        statement_timeout: Duration,
    ) -> Result<Box<dyn StorageTransaction>>;
}

/// One open storage transaction.
///
/// Dropping it without `commit` rolls it back.
#[async_trait::async_trait]
pub trait StorageTransaction: Send {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
