//! Shared fixtures for caseguard-core integration tests.

#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use caseguard_core::{
    config::{LockConfig, QueueConfig, TransactionConfig},
    lock::MemoryAdvisoryBackend,
    transaction::MemoryTransactionBackend,
    AdvisoryLockService, QueueManager, TransactionManager,
};

/// In-memory stack with short timeouts.
pub struct Harness {
    pub backend: Arc<MemoryAdvisoryBackend>,
    pub storage: MemoryTransactionBackend,
    pub locks: AdvisoryLockService,
    pub transactions: TransactionManager,
    pub queue: QueueManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(QueueConfig {
            retry_backoff_ms: 0,
            tick_interval_ms: 5,
            ..QueueConfig::default()
        })
    }

    pub fn with_queue(queue: QueueConfig) -> Self {
        let backend = Arc::new(MemoryAdvisoryBackend::new());
        let storage = MemoryTransactionBackend::new();
        let locks = AdvisoryLockService::with_config(
            backend.clone(),
            LockConfig {
                default_timeout_ms: 2_000,
                retry_interval_ms: 2,
            },
        );
        let transactions = TransactionManager::with_config(
            locks.clone(),
            Arc::new(storage.clone()),
            TransactionConfig {
                default_timeout_ms: 2_000,
                ..TransactionConfig::default()
            },
        );
        let queue = QueueManager::with_config(transactions.clone(), queue);
        Self {
            backend,
            storage,
            locks,
            transactions,
            queue,
        }
    }
}

/// Poll `check` every few milliseconds until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    check().await
}
