//! Advisory lock service.
//!
//! Named, typed, timeout-bounded mutual exclusion on top of an
//! [`AdvisoryBackend`], plus an in-memory registry of the locks this process
//! holds.
//!
//! Acquisition polls the backend's try-lock primitive at a fixed interval until
//! it succeeds or the timeout elapses; it never parks a connection in a
//! blocking wait. Contention is reported as `Ok(None)`, never as an error.
//!
//! The registry is an index for introspection and bulk release only. Whether a
//! lock is free is always decided by the backend.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{collections::HashMap, future::Future, sync::Arc};

use chrono::Utc;
use tokio::{sync::RwLock, time::Instant};
use uuid::Uuid;

use super::{
    backend::AdvisoryBackend,
    key::{backend_target, lock_key},
    types::{LockHealth, LockInfo, LockMode, LockOptions, LockType},
};
use crate::{config::LockConfig, Error, Result};

type RegistryKey = (LockType, String, LockMode);

/// Advisory lock service. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct AdvisoryLockService {
    backend: Arc<dyn AdvisoryBackend>,
    registry: Arc<RwLock<HashMap<RegistryKey, Vec<LockInfo>>>>,
    config: LockConfig,
}

impl std::fmt::Debug for AdvisoryLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLockService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdvisoryLockService {
    /// Create a service with default timeouts.
    pub fn new(backend: Arc<dyn AdvisoryBackend>) -> Self {
        Self::with_config(backend, LockConfig::default())
    }

    pub fn with_config(backend: Arc<dyn AdvisoryBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            registry: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire a lock, polling until `options.timeout` elapses.
    ///
    /// Returns `Ok(None)` when the lock stayed unavailable for the whole
    /// window. Errors only for backing-store failures.
    pub async fn acquire_lock(
        &self,
        entity_type: LockType,
        entity_id: &str,
        mode: LockMode,
        options: LockOptions,
    ) -> Result<Option<LockInfo>> {
        let timeout = options.timeout.unwrap_or_else(|| self.config.default_timeout());
        let (key, kind) = backend_target(entity_type, entity_id, mode);
        let lock_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.backend.try_acquire(&lock_id, key, kind).await? {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id,
                    mode = %mode,
                    waited_ms = started.elapsed().as_millis(),
                    "Lock acquisition timed out"
                );
                return Ok(None);
            }
            tokio::time::sleep(self.config.retry_interval().min(deadline - now)).await;
        }

        let acquired_at = Utc::now();
        let info = LockInfo {
            lock_id,
            entity_type,
            entity_id: entity_id.to_string(),
            mode,
            user_id: options.user_id,
            session_id: options.session_id,
            acquired_at,
            expires_at: chrono::Duration::from_std(timeout)
                .ok()
                .map(|ttl| acquired_at + ttl),
            metadata: options.metadata,
        };

        self.registry
            .write()
            .await
            .entry((entity_type, entity_id.to_string(), mode))
            .or_default()
            .push(info.clone());

        tracing::debug!(
            lock_id = %info.lock_id,
            entity_type = %entity_type,
            entity_id,
            mode = %mode,
            key,
            waited_ms = started.elapsed().as_millis(),
            "Lock acquired"
        );
        Ok(Some(info))
    }

    /// Release the most recently acquired lock for `(entity_type, entity_id, mode)`.
    ///
    /// Returns `false` (and logs) when this process holds no such lock or
    /// the store refuses the unlock. Never errors.
    pub async fn release_lock(&self, entity_type: LockType, entity_id: &str, mode: LockMode) -> bool {
        let latest = {
            let registry = self.registry.read().await;
            registry
                .get(&(entity_type, entity_id.to_string(), mode))
                .and_then(|held| held.last().cloned())
        };

        match latest {
            Some(info) => self.release(&info).await,
            None => {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id,
                    mode = %mode,
                    "Release requested for a lock this process does not hold"
                );
                false
            }
        }
    }

    /// Release exactly the lock described by `info`.
    pub async fn release(&self, info: &LockInfo) -> bool {
        let (key, kind) = backend_target(info.entity_type, &info.entity_id, info.mode);

        match self.backend.release(&info.lock_id, key, kind).await {
            Ok(released) => {
                self.forget(info).await;
                if released {
                    tracing::debug!(
                        lock_id = %info.lock_id,
                        entity_type = %info.entity_type,
                        entity_id = %info.entity_id,
                        mode = %info.mode,
                        "Lock released"
                    );
                } else {
                    tracing::warn!(
                        lock_id = %info.lock_id,
                        entity_type = %info.entity_type,
                        entity_id = %info.entity_id,
                        mode = %info.mode,
                        "Lock was not held by its holder at release"
                    );
                }
                released
            }
            Err(e) => {
                tracing::warn!(
                    lock_id = %info.lock_id,
                    entity_type = %info.entity_type,
                    entity_id = %info.entity_id,
                    mode = %info.mode,
                    error = %e,
                    "Failed to release lock"
                );
                false
            }
        }
    }

    async fn forget(&self, info: &LockInfo) {
        let key = (info.entity_type, info.entity_id.clone(), info.mode);
        let mut registry = self.registry.write().await;
        if let Some(held) = registry.get_mut(&key) {
            held.retain(|entry| entry.lock_id != info.lock_id);
            if held.is_empty() {
                registry.remove(&key);
            }
        }
    }

    /// Run `f` while holding the lock, releasing it on every exit path.
    ///
    /// Fails with [`Error::LockUnavailable`] when the lock is not acquired in time.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        entity_type: LockType,
        entity_id: &str,
        mode: LockMode,
        options: LockOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let started = Instant::now();
        let info = self
            .acquire_lock(entity_type, entity_id, mode, options)
            .await?
            .ok_or_else(|| Error::lock_unavailable(entity_type, entity_id, mode, started.elapsed()))?;

        let guard = LockGuard::new(self.clone(), info);
        let outcome = f().await;
        guard.release().await;
        outcome
    }

    /// Whether any session (not just this process) holds the entity's key.
    ///
    /// With `mode == None` only the base key is inspected, so `update` locks
    /// (held on `key + 1`) are not seen.
    pub async fn is_locked(
        &self,
        entity_type: LockType,
        entity_id: &str,
        mode: Option<LockMode>,
    ) -> Result<bool> {
        match mode {
            Some(mode) => {
                let (key, kind) = backend_target(entity_type, entity_id, mode);
                self.backend.is_locked(key, Some(kind)).await
            }
            None => self.backend.is_locked(lock_key(entity_type, entity_id), None).await,
        }
    }

    /// Locks held by this process, optionally filtered.
    pub async fn get_lock_info(
        &self,
        entity_type: Option<LockType>,
        entity_id: Option<&str>,
    ) -> Vec<LockInfo> {
        let registry = self.registry.read().await;
        let mut locks: Vec<LockInfo> = registry
            .values()
            .flatten()
            .filter(|info| entity_type.map_or(true, |t| info.entity_type == t))
            .filter(|info| entity_id.map_or(true, |id| info.entity_id == id))
            .cloned()
            .collect();
        locks.sort_by_key(|info| info.acquired_at);
        locks
    }

    /// Release every lock tagged with `session_id`. Returns how many were released.
    pub async fn release_session_locks(&self, session_id: &str) -> usize {
        let tagged: Vec<LockInfo> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .flatten()
                .filter(|info| info.session_id.as_deref() == Some(session_id))
                .cloned()
                .collect()
        };

        let mut released = 0;
        for info in &tagged {
            if self.release(info).await {
                released += 1;
            }
        }

        tracing::info!(
            session_id,
            released,
            tagged = tagged.len(),
            "Released session locks"
        );
        released
    }

    /// Release registry entries past their expiry, best-effort.
    pub async fn health_check(&self) -> LockHealth {
        let now = Utc::now();
        let (active, expired): (usize, Vec<LockInfo>) = {
            let registry = self.registry.read().await;
            let active = registry.values().map(Vec::len).sum();
            let expired = registry
                .values()
                .flatten()
                .filter(|info| info.is_expired_at(now))
                .cloned()
                .collect();
            (active, expired)
        };

        let mut cleaned = 0;
        for info in &expired {
            if self.release(info).await {
                cleaned += 1;
            }
        }

        if !expired.is_empty() {
            tracing::warn!(active, expired = expired.len(), cleaned, "Reclaimed expired locks");
        }

        LockHealth {
            active,
            expired: expired.len(),
            cleaned,
        }
    }
}

/// Releases its lock when dropped without an explicit [`LockGuard::release`].
///
/// Covers cancellation and panics inside a critical section: the release is
/// spawned onto the current runtime.
pub(crate) struct LockGuard {
    service: AdvisoryLockService,
    info: Option<LockInfo>,
}

impl LockGuard {
    pub(crate) const fn new(service: AdvisoryLockService, info: LockInfo) -> Self {
        Self {
            service,
            info: Some(info),
        }
    }

    pub(crate) async fn release(mut self) -> bool {
        match self.info.take() {
            Some(info) => self.service.release(&info).await,
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(info) = self.info.take() else {
            return;
        };
        let service = self.service.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    service.release(&info).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    lock_id = %info.lock_id,
                    entity_type = %info.entity_type,
                    entity_id = %info.entity_id,
                    "Lock dropped outside a runtime; left for session teardown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::lock::MemoryAdvisoryBackend;

    fn fast_config() -> LockConfig {
        LockConfig {
            default_timeout_ms: 200,
            retry_interval_ms: 5,
        }
    }

    fn service() -> (AdvisoryLockService, Arc<MemoryAdvisoryBackend>) {
        let backend = Arc::new(MemoryAdvisoryBackend::new());
        (
            AdvisoryLockService::with_config(backend.clone(), fast_config()),
            backend,
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() -> Result<()> {
        let (locks, _) = service();
        let info = locks
            .acquire_lock(LockType::Case, "C1", LockMode::Exclusive, LockOptions::new())
            .await?;
        let info = info.ok_or_else(|| Error::Validation("expected lock".into()))?;
        assert_eq!(info.entity_id, "C1");
        assert!(info.expires_at.is_some());
        assert!(locks.is_locked(LockType::Case, "C1", None).await?);

        assert!(locks.release_lock(LockType::Case, "C1", LockMode::Exclusive).await);
        assert!(!locks.is_locked(LockType::Case, "C1", None).await?);
        assert!(locks.get_lock_info(None, None).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_contention_returns_none_within_timeout() -> Result<()> {
        let (locks, _) = service();
        let first = locks
            .acquire_lock(LockType::Case, "C1", LockMode::Exclusive, LockOptions::new())
            .await?;
        assert!(first.is_some());

        let started = std::time::Instant::now();
        let second = locks
            .acquire_lock(
                LockType::Case,
                "C1",
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_millis(60)),
            )
            .await?;
        let elapsed = started.elapsed();

        assert!(second.is_none());
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(60) + Duration::from_millis(200));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_not_held_returns_false() {
        let (locks, _) = service();
        assert!(!locks.release_lock(LockType::User, "U1", LockMode::Shared).await);
    }

    #[tokio::test]
    async fn test_release_survives_store_outage() -> Result<()> {
        let (locks, backend) = service();
        let info = locks
            .acquire_lock(LockType::Case, "C1", LockMode::Exclusive, LockOptions::new())
            .await?
            .ok_or_else(|| Error::Validation("expected lock".into()))?;

        backend.set_available(false);
        assert!(!locks.release(&info).await);
        assert_eq!(locks.get_lock_info(None, None).await.len(), 1);

        backend.set_available(true);
        assert!(locks.release(&info).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_mode_does_not_block_exclusive() -> Result<()> {
        let (locks, _) = service();
        let update = locks
            .acquire_lock(LockType::Document, "D1", LockMode::Update, LockOptions::new())
            .await?;
        let exclusive = locks
            .acquire_lock(LockType::Document, "D1", LockMode::Exclusive, LockOptions::new())
            .await?;
        assert!(update.is_some());
        assert!(exclusive.is_some());

        let second_update = locks
            .acquire_lock(
                LockType::Document,
                "D1",
                LockMode::Update,
                LockOptions::new().with_timeout(Duration::from_millis(20)),
            )
            .await?;
        assert!(second_update.is_none());
        assert!(locks.is_locked(LockType::Document, "D1", Some(LockMode::Update)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() -> Result<()> {
        let (locks, _) = service();
        let outcome: Result<()> = locks
            .with_lock(
                LockType::Evidence,
                "E1",
                LockMode::Exclusive,
                LockOptions::new(),
                || async { Err(Error::Validation("boom".into())) },
            )
            .await;
        assert!(matches!(outcome, Err(Error::Validation(_))));
        assert!(!locks.is_locked(LockType::Evidence, "E1", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_with_lock_fails_when_unavailable() -> Result<()> {
        let (locks, _) = service();
        let _held = locks
            .acquire_lock(LockType::Evidence, "E1", LockMode::Exclusive, LockOptions::new())
            .await?;
        let ran = AtomicUsize::new(0);
        let outcome: Result<()> = locks
            .with_lock(
                LockType::Evidence,
                "E1",
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_millis(20)),
                || async {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert!(matches!(outcome, Err(Error::LockUnavailable { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_session_locks() -> Result<()> {
        let (locks, _) = service();
        for id in ["A", "B"] {
            locks
                .acquire_lock(
                    LockType::Workflow,
                    id,
                    LockMode::Exclusive,
                    LockOptions::new().with_session("s-1"),
                )
                .await?;
        }
        locks
            .acquire_lock(
                LockType::Workflow,
                "C",
                LockMode::Exclusive,
                LockOptions::new().with_session("s-2"),
            )
            .await?;

        assert_eq!(locks.release_session_locks("s-1").await, 2);
        let remaining = locks.get_lock_info(Some(LockType::Workflow), None).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_id, "C");
        Ok(())
    }

    #[tokio::test]
    async fn test_health_check_reclaims_expired() -> Result<()> {
        let (locks, _) = service();
        locks
            .acquire_lock(
                LockType::Analysis,
                "A1",
                LockMode::Exclusive,
                LockOptions::new().with_timeout(Duration::from_millis(10)),
            )
            .await?;
        locks
            .acquire_lock(LockType::Analysis, "A2", LockMode::Exclusive, LockOptions::new())
            .await?;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let health = locks.health_check().await;

        assert_eq!(
            health,
            LockHealth {
                active: 2,
                expired: 1,
                cleaned: 1
            }
        );
        assert!(!locks.is_locked(LockType::Analysis, "A1", None).await?);
        assert!(locks.is_locked(LockType::Analysis, "A2", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() -> Result<()> {
        let (locks, _) = service();
        let info = locks
            .acquire_lock(LockType::Case, "C9", LockMode::Exclusive, LockOptions::new())
            .await?
            .ok_or_else(|| Error::Validation("expected lock".into()))?;
        drop(LockGuard::new(locks.clone(), info));

        for _ in 0..50 {
            if !locks.is_locked(LockType::Case, "C9", None).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(Error::Validation("guard did not release the lock".into()))
    }
}
