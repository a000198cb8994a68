//! Transaction manager.
//!
//! Binds one storage transaction to the advisory locks taken while it runs.
//! Every exit path (success, error, cancellation, forced cleanup) releases the
//! transaction's locks newest-first, ends the storage transaction and drops
//! the transaction from the active table.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use itertools::Itertools;
use tokio::{sync::RwLock, time::Instant};

use super::{
    backend::TransactionBackend,
    context::{EntityLock, TransactionContext, TransactionHandle, TransactionOptions, TransactionState},
    isolation::IsolationLevel,
};
use crate::{
    config::TransactionConfig,
    lock::{AdvisoryLockService, LockInfo, LockMode, LockOptions, LockType},
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════

/// Transaction manager. Cheap to clone; clones share the active table.
#[derive(Clone)]
pub struct TransactionManager {
    locks: AdvisoryLockService,
    backend: Arc<dyn TransactionBackend>,
    active: Arc<RwLock<HashMap<String, TransactionHandle>>>,
    config: TransactionConfig,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("locks", &self.locks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(locks: AdvisoryLockService, backend: Arc<dyn TransactionBackend>) -> Self {
        Self::with_config(locks, backend, TransactionConfig::default())
    }

    pub fn with_config(
        locks: AdvisoryLockService,
        backend: Arc<dyn TransactionBackend>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            locks,
            backend,
            active: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[must_use]
    pub const fn lock_service(&self) -> &AdvisoryLockService {
        &self.locks
    }

    #[must_use]
    pub const fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run `f` inside a storage transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Locks still
    /// attributed to the transaction are released before the outcome is
    /// returned.
    pub async fn with_transaction<F, Fut, T, E>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let isolation = options.isolation.unwrap_or(self.config.default_isolation);
        let timeout = options.timeout.unwrap_or_else(|| self.config.default_timeout());

        let storage = self.backend.begin(isolation, timeout).await?;
        let handle = TransactionHandle::open(storage, isolation, options);
        self.active
            .write()
            .await
            .insert(handle.id().to_string(), handle.clone());

        tracing::debug!(
            transaction_id = %handle.id(),
            isolation = %isolation,
            timeout_ms = timeout.as_millis(),
            "Transaction started"
        );

        let guard = TransactionGuard::new(self.clone(), handle.clone());
        let outcome = f(handle).await;
        let finished = guard.finish(outcome.is_ok()).await;

        match (outcome, finished) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }

    /// Acquire a lock on behalf of a running transaction.
    ///
    /// The lock is released when the transaction ends unless released earlier
    /// with [`Self::release_within`].
    pub async fn lock_within(
        &self,
        tx: &TransactionHandle,
        entity_type: LockType,
        entity_id: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockInfo> {
        if tx.state().await.is_terminal() {
            return Err(Error::TransactionClosed(tx.id().to_string()));
        }

        let mut options = LockOptions::new()
            .with_timeout(timeout.unwrap_or_else(|| self.config.default_timeout()));
        options.user_id = tx.user_id().map(str::to_string);
        options.session_id = tx.session_id().map(str::to_string);

        let started = Instant::now();
        let info = self
            .locks
            .acquire_lock(entity_type, entity_id, mode, options)
            .await?
            .ok_or_else(|| Error::lock_unavailable(entity_type, entity_id, mode, started.elapsed()))?;

        // Force-cleaned while we were polling.
        if tx.state().await.is_terminal() {
            self.locks.release(&info).await;
            return Err(Error::TransactionClosed(tx.id().to_string()));
        }

        tx.record_lock(info.clone()).await;
        Ok(info)
    }

    /// Release a lock taken with [`Self::lock_within`] before the transaction ends.
    pub async fn release_within(&self, tx: &TransactionHandle, info: &LockInfo) -> bool {
        tx.forget_lock(&info.lock_id).await;
        self.locks.release(info).await
    }

    /// Run `f` in a transaction while holding one entity lock.
    ///
    /// The lock is held for the whole of `f` and released before the
    /// transaction commits or rolls back. `f` never runs if the lock is not
    /// acquired within the transaction timeout.
    pub async fn with_transaction_and_lock<F, Fut, T, E>(
        &self,
        entity_type: LockType,
        entity_id: &str,
        mode: LockMode,
        options: TransactionOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let manager = self.clone();
        let entity_id = entity_id.to_string();
        let timeout = options.timeout;

        self.with_transaction(options, move |tx| async move {
            let info = manager
                .lock_within(&tx, entity_type, &entity_id, mode, timeout)
                .await?;
            let outcome = f(tx.clone()).await;
            manager.release_within(&tx, &info).await;
            outcome
        })
        .await
    }

    /// Chain-of-custody writes: exclusive evidence lock, serializable.
    pub async fn with_custody_transaction<F, Fut, T, E>(
        &self,
        evidence_id: &str,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.with_transaction_and_lock(
            LockType::Evidence,
            evidence_id,
            LockMode::Exclusive,
            TransactionOptions::new().with_isolation(IsolationLevel::Serializable),
            f,
        )
        .await
    }

    /// Case updates: exclusive case lock, repeatable read.
    pub async fn with_case_transaction<F, Fut, T, E>(
        &self,
        case_id: &str,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.with_transaction_and_lock(
            LockType::Case,
            case_id,
            LockMode::Exclusive,
            TransactionOptions::new().with_isolation(IsolationLevel::RepeatableRead),
            f,
        )
        .await
    }

    /// Document analysis. Readers share the document at read committed;
    /// writers hold it exclusively at repeatable read.
    pub async fn with_document_analysis_transaction<F, Fut, T, E>(
        &self,
        document_id: &str,
        read_only: bool,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let (mode, isolation) = if read_only {
            (LockMode::Shared, IsolationLevel::ReadCommitted)
        } else {
            (LockMode::Exclusive, IsolationLevel::RepeatableRead)
        };
        self.with_transaction_and_lock(
            LockType::Document,
            document_id,
            mode,
            TransactionOptions::new().with_isolation(isolation),
            f,
        )
        .await
    }

    /// Vector index rebuilds: exclusive, serializable, long timeout.
    pub async fn with_vector_index_transaction<F, Fut, T, E>(
        &self,
        index_name: &str,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.with_transaction_and_lock(
            LockType::VectorIndex,
            index_name,
            LockMode::Exclusive,
            TransactionOptions::new()
                .with_isolation(IsolationLevel::Serializable)
                .with_timeout(self.config.vector_index_timeout()),
            f,
        )
        .await
    }

    /// Run `f` while holding locks on every entity in `entities`.
    ///
    /// Locks are taken in ascending `type:id` order and released in reverse,
    /// so overlapping requests can never wait on each other in a cycle. If any
    /// lock is unavailable, the ones already taken are released and `f` does
    /// not run.
    pub async fn with_multi_entity_transaction<F, Fut, T, E>(
        &self,
        entities: &[EntityLock],
        options: TransactionOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let ordered = canonical_order(entities);
        let manager = self.clone();
        let timeout = options.timeout;

        self.with_transaction(options, move |tx| async move {
            for entity in &ordered {
                manager
                    .lock_within(&tx, entity.entity_type, &entity.entity_id, entity.mode, timeout)
                    .await?;
            }
            f(tx).await
        })
        .await
    }

    /// Snapshots of every in-flight transaction, oldest first.
    pub async fn get_active_transactions(&self) -> Vec<TransactionContext> {
        let handles: Vec<TransactionHandle> = self.active.read().await.values().cloned().collect();
        let mut contexts = Vec::with_capacity(handles.len());
        for handle in &handles {
            contexts.push(handle.context().await);
        }
        contexts.sort_by_key(|context| context.started_at);
        contexts
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> Option<TransactionContext> {
        let handle = self.active.read().await.get(transaction_id).cloned()?;
        Some(handle.context().await)
    }

    /// Force-clean transactions older than the configured maximum age.
    ///
    /// Their locks are released and their storage transactions rolled back.
    /// Returns how many were cleaned.
    pub async fn cleanup_expired_transactions(&self) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(self.config.max_age()) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let expired: Vec<TransactionHandle> = self
            .active
            .read()
            .await
            .values()
            .filter(|handle| handle.started_at() < cutoff)
            .cloned()
            .collect();

        for handle in &expired {
            tracing::warn!(
                transaction_id = %handle.id(),
                started_at = %handle.started_at(),
                "Force-cleaning expired transaction"
            );
            if let Err(e) = self.finish(handle, false).await {
                tracing::error!(
                    transaction_id = %handle.id(),
                    error = %e,
                    "Rollback failed during forced cleanup"
                );
            }
        }
        expired.len()
    }

    /// End a transaction: release locks newest-first, commit or roll back,
    /// then drop it from the active table.
    async fn finish(&self, handle: &TransactionHandle, commit: bool) -> Result<()> {
        for info in handle.drain_locks_reversed().await {
            self.locks.release(&info).await;
        }

        let outcome = match handle.take_storage().await {
            Some(storage) if commit => storage.commit().await,
            Some(storage) => storage.rollback().await,
            // Already ended by forced cleanup; a commit can no longer happen.
            None if commit => Err(Error::TransactionClosed(handle.id().to_string())),
            None => Ok(()),
        };

        if !handle.state().await.is_terminal() {
            let state = if commit && outcome.is_ok() {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            };
            handle.set_state(state).await;
        }
        self.active.write().await.remove(handle.id());

        match &outcome {
            Ok(()) => tracing::debug!(
                transaction_id = %handle.id(),
                committed = commit,
                "Transaction finished"
            ),
            Err(e) => tracing::warn!(
                transaction_id = %handle.id(),
                error = %e,
                "Transaction did not finish cleanly"
            ),
        }
        outcome
    }
}

/// Sort by `type:id` then mode, drop duplicates, and drop `shared` requests
/// for entities that are also requested `exclusive`. `update` sits on a
/// different key and does not cover a `shared` read.
fn canonical_order(entities: &[EntityLock]) -> Vec<EntityLock> {
    let sorted: Vec<EntityLock> = entities
        .iter()
        .cloned()
        .sorted_by(|a, b| {
            a.ordering_key()
                .cmp(&b.ordering_key())
                .then_with(|| a.mode.cmp(&b.mode))
        })
        .dedup()
        .collect();

    sorted
        .iter()
        .filter(|entity| {
            entity.mode != LockMode::Shared
                || !sorted.iter().any(|other| {
                    other.mode.is_exclusive()
                        && other.entity_type == entity.entity_type
                        && other.entity_id == entity.entity_id
                })
        })
        .cloned()
        .collect()
}

/// Rolls the transaction back if dropped before [`TransactionGuard::finish`].
struct TransactionGuard {
    manager: TransactionManager,
    handle: Option<TransactionHandle>,
}

impl TransactionGuard {
    const fn new(manager: TransactionManager, handle: TransactionHandle) -> Self {
        Self {
            manager,
            handle: Some(handle),
        }
    }

    async fn finish(mut self, commit: bool) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.manager.finish(&handle, commit).await,
            None => Ok(()),
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tracing::warn!(
                        transaction_id = %handle.id(),
                        "Transaction abandoned; rolling back"
                    );
                    let _ = manager.finish(&handle, false).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    transaction_id = %handle.id(),
                    "Transaction dropped outside a runtime; left for session teardown"
                );
            }
        }
    }
}
