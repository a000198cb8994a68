//! Transaction context, handle and options.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{backend::StorageTransaction, isolation::IsolationLevel};
use crate::{
    lock::{LockInfo, LockMode, LockType},
    Error, Result,
};

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl TransactionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Point-in-time view of one logical unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionContext {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub isolation: IsolationLevel,
    /// Locks in acquisition order; released in reverse.
    pub locks: Vec<LockInfo>,
    pub state: TransactionState,
    pub metadata: Option<Map<String, Value>>,
}

/// Options for one transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Falls back to the manager's default isolation.
    pub isolation: Option<IsolationLevel>,
    /// Statement timeout and lock acquisition timeout.
    pub timeout: Option<Duration>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl TransactionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One entity in a multi-entity lock request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityLock {
    pub entity_type: LockType,
    pub entity_id: String,
    pub mode: LockMode,
}

impl EntityLock {
    pub fn new(entity_type: LockType, entity_id: impl Into<String>, mode: LockMode) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            mode,
        }
    }

    pub fn exclusive(entity_type: LockType, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, LockMode::Exclusive)
    }

    pub fn shared(entity_type: LockType, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, LockMode::Shared)
    }

    /// Global ordering key, `"{type}:{id}"`.
    #[must_use]
    pub fn ordering_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

struct TransactionInner {
    id: String,
    started_at: DateTime<Utc>,
    user_id: Option<String>,
    session_id: Option<String>,
    isolation: IsolationLevel,
    metadata: Option<Map<String, Value>>,
    locks: Mutex<Vec<LockInfo>>,
    storage: Mutex<Option<Box<dyn StorageTransaction>>>,
    state: Mutex<TransactionState>,
}

/// Handle passed to transaction closures.
///
/// Clones refer to the same transaction. Once the transaction has ended the
/// handle only reports its final context; `execute` fails.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("isolation", &self.inner.isolation)
            .finish_non_exhaustive()
    }
}

impl TransactionHandle {
    pub(crate) fn open(
        storage: Box<dyn StorageTransaction>,
        isolation: IsolationLevel,
        options: TransactionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                user_id: options.user_id,
                session_id: options.session_id,
                isolation,
                metadata: options.metadata,
                locks: Mutex::new(Vec::new()),
                storage: Mutex::new(Some(storage)),
                state: Mutex::new(TransactionState::Open),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    pub async fn state(&self) -> TransactionState {
        *self.inner.state.lock().await
    }

    /// Locks currently attributed to this transaction, in acquisition order.
    pub async fn locks(&self) -> Vec<LockInfo> {
        self.inner.locks.lock().await.clone()
    }

    pub async fn context(&self) -> TransactionContext {
        TransactionContext {
            id: self.inner.id.clone(),
            started_at: self.inner.started_at,
            user_id: self.inner.user_id.clone(),
            session_id: self.inner.session_id.clone(),
            isolation: self.inner.isolation,
            locks: self.locks().await,
            state: self.state().await,
            metadata: self.inner.metadata.clone(),
        }
    }

    /// Run a statement inside the storage transaction.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut storage = self.inner.storage.lock().await;
        match storage.as_mut() {
            Some(tx) => tx.execute(sql).await,
            None => Err(Error::TransactionClosed(self.inner.id.clone())),
        }
    }

    pub(crate) async fn record_lock(&self, info: LockInfo) {
        self.inner.locks.lock().await.push(info);
    }

    pub(crate) async fn forget_lock(&self, lock_id: &str) {
        self.inner
            .locks
            .lock()
            .await
            .retain(|info| info.lock_id != lock_id);
    }

    /// Remove every tracked lock, newest first.
    pub(crate) async fn drain_locks_reversed(&self) -> Vec<LockInfo> {
        let mut locks = std::mem::take(&mut *self.inner.locks.lock().await);
        locks.reverse();
        locks
    }

    pub(crate) async fn take_storage(&self) -> Option<Box<dyn StorageTransaction>> {
        self.inner.storage.lock().await.take()
    }

    pub(crate) async fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{MemoryTransactionBackend, TransactionBackend};

    async fn handle() -> Result<TransactionHandle> {
        let storage = MemoryTransactionBackend::new()
            .begin(IsolationLevel::ReadCommitted, Duration::from_secs(1))
            .await?;
        Ok(TransactionHandle::open(
            storage,
            IsolationLevel::ReadCommitted,
            TransactionOptions::new().with_user("u-1"),
        ))
    }

    #[test]
    fn test_ordering_key() {
        let entity = EntityLock::shared(LockType::ChainOfCustody, "E-7");
        assert_eq!(entity.ordering_key(), "chain_of_custody:E-7");
    }

    #[tokio::test]
    async fn test_execute_after_storage_taken_is_closed() -> Result<()> {
        let handle = handle().await?;
        assert_eq!(handle.execute("SELECT 1").await?, 0);

        drop(handle.take_storage().await);
        let result = handle.execute("SELECT 1").await;
        assert!(matches!(result, Err(Error::TransactionClosed(id)) if id == handle.id()));
        Ok(())
    }

    #[tokio::test]
    async fn test_context_snapshot() -> Result<()> {
        let handle = handle().await?;
        let context = handle.context().await;
        assert_eq!(context.id, handle.id());
        assert_eq!(context.user_id.as_deref(), Some("u-1"));
        assert_eq!(context.state, TransactionState::Open);
        assert!(context.locks.is_empty());
        Ok(())
    }
}
