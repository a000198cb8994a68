//! Periodic maintenance: reclaim expired locks, force-clean stale
//! transactions and sweep the queue.

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    config::MaintenanceConfig,
    lock::{AdvisoryLockService, LockHealth},
    queue::{HealthStatus, QueueHealth, QueueManager},
    transaction::TransactionManager,
};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub locks: LockHealth,
    pub transactions_cleaned: usize,
    pub queue: QueueHealth,
}

/// Run every sweep once.
pub async fn run_maintenance(
    locks: &AdvisoryLockService,
    transactions: &TransactionManager,
    queue: &QueueManager,
) -> MaintenanceReport {
    let lock_health = locks.health_check().await;
    let transactions_cleaned = transactions.cleanup_expired_transactions().await;
    let queue_health = queue.health_check().await;

    match queue_health.status {
        HealthStatus::Healthy => tracing::info!(
            active_locks = lock_health.active,
            reclaimed_locks = lock_health.cleaned,
            transactions_cleaned,
            pending = queue_health.stats.pending,
            processing = queue_health.stats.processing,
            "Maintenance pass complete"
        ),
        status => tracing::warn!(
            ?status,
            active_locks = lock_health.active,
            reclaimed_locks = lock_health.cleaned,
            transactions_cleaned,
            issues = ?queue_health.issues,
            "Maintenance pass found problems"
        ),
    }

    MaintenanceReport {
        locks: lock_health,
        transactions_cleaned,
        queue: queue_health,
    }
}

/// Run [`run_maintenance`] every `config.interval()` until the task is aborted.
pub fn spawn_maintenance(
    locks: AdvisoryLockService,
    transactions: TransactionManager,
    queue: QueueManager,
    config: MaintenanceConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(config.interval()).await;
            run_maintenance(&locks, &transactions, &queue).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        config::{LockConfig, TransactionConfig},
        lock::{LockMode, LockOptions, LockType, MemoryAdvisoryBackend},
        transaction::MemoryTransactionBackend,
        Result,
    };

    #[tokio::test]
    async fn test_pass_reclaims_expired_locks() -> Result<()> {
        let locks = AdvisoryLockService::with_config(
            Arc::new(MemoryAdvisoryBackend::new()),
            LockConfig {
                default_timeout_ms: 5,
                retry_interval_ms: 1,
            },
        );
        let transactions = TransactionManager::with_config(
            locks.clone(),
            Arc::new(MemoryTransactionBackend::new()),
            TransactionConfig::default(),
        );
        let queue = QueueManager::new(transactions.clone());

        locks
            .acquire_lock(LockType::User, "U1", LockMode::Exclusive, LockOptions::new())
            .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = run_maintenance(&locks, &transactions, &queue).await;
        assert_eq!(report.locks.cleaned, 1);
        assert_eq!(report.transactions_cleaned, 0);
        assert_eq!(report.queue.status, HealthStatus::Healthy);
        assert!(!locks.is_locked(LockType::User, "U1", None).await?);
        Ok(())
    }
}
