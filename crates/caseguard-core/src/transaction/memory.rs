//! In-process transaction backend.
//!
//! There is no data to protect; it keeps a ledger of what happened to each
//! transaction so the lock/transaction lifecycle can be observed.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{
    backend::{StorageTransaction, TransactionBackend},
    isolation::IsolationLevel,
};
use crate::{Error, Result};

/// Counters kept by [`MemoryTransactionBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionLedger {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub last_isolation: Option<IsolationLevel>,
    pub last_statement_timeout: Option<Duration>,
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionBackend {
    ledger: Arc<Mutex<TransactionLedger>>,
}

fn lock_ledger(ledger: &Mutex<TransactionLedger>) -> MutexGuard<'_, TransactionLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransactionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the ledger.
    #[must_use]
    pub fn ledger(&self) -> TransactionLedger {
        lock_ledger(&self.ledger).clone()
    }
}

#[async_trait::async_trait]
impl TransactionBackend for MemoryTransactionBackend {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        statement_timeout: Duration,
    ) -> Result<Box<dyn StorageTransaction>> {
        {
            let mut ledger = lock_ledger(&self.ledger);
            ledger.begun += 1;
            ledger.last_isolation = Some(isolation);
            ledger.last_statement_timeout = Some(statement_timeout);
        }
        Ok(Box::new(MemoryTransaction {
            ledger: Arc::clone(&self.ledger),
            finished: false,
        }))
    }
}

struct MemoryTransaction {
    ledger: Arc<Mutex<TransactionLedger>>,
    finished: bool,
}

#[async_trait::async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        if sql.trim().is_empty() {
            return Err(Error::Database("empty statement".into()));
        }
        lock_ledger(&self.ledger).statements.push(sql.to_string());
        Ok(0)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        lock_ledger(&self.ledger).committed += 1;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        lock_ledger(&self.ledger).rolled_back += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            lock_ledger(&self.ledger).rolled_back += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ledger_tracks_lifecycle() -> Result<()> {
        let backend = MemoryTransactionBackend::new();

        let mut tx = backend
            .begin(IsolationLevel::Serializable, Duration::from_secs(5))
            .await?;
        tx.execute("UPDATE cases SET status = 'closed'").await?;
        tx.commit().await?;

        let tx = backend
            .begin(IsolationLevel::ReadCommitted, Duration::from_secs(1))
            .await?;
        drop(tx);

        let ledger = backend.ledger();
        assert_eq!(ledger.begun, 2);
        assert_eq!(ledger.committed, 1);
        assert_eq!(ledger.rolled_back, 1);
        assert_eq!(ledger.last_isolation, Some(IsolationLevel::ReadCommitted));
        assert_eq!(ledger.statements.len(), 1);
        Ok(())
    }
}
