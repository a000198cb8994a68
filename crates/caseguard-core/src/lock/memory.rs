//! In-process advisory lock table.
//!
//! Mirrors the session semantics of a database advisory lock: locks are
//! re-entrant per holder (each acquire needs a matching release), exclusive
//! excludes every other holder, shared excludes only exclusive holders.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::Mutex;

use super::{backend::AdvisoryBackend, key::LockKind};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct KeySlot {
    exclusive: Option<(String, u32)>,
    shared: HashMap<String, u32>,
}

impl KeySlot {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    fn held_by_other(&self, holder: &str, kind: LockKind) -> bool {
        let exclusive_other = self
            .exclusive
            .as_ref()
            .is_some_and(|(owner, _)| owner != holder);
        match kind {
            LockKind::Shared => exclusive_other,
            LockKind::Exclusive => {
                exclusive_other || self.shared.keys().any(|owner| owner != holder)
            }
        }
    }
}

/// Advisory lock backend kept entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryAdvisoryBackend {
    slots: Arc<Mutex<HashMap<i64, KeySlot>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryAdvisoryBackend {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryAdvisoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Database("advisory lock store unavailable".into()))
        }
    }

    /// Number of keys with at least one holder.
    pub async fn held_key_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[async_trait::async_trait]
impl AdvisoryBackend for MemoryAdvisoryBackend {
    async fn try_acquire(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool> {
        self.ensure_available()?;
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key).or_default();

        if slot.held_by_other(holder, kind) {
            if slot.is_free() {
                slots.remove(&key);
            }
            return Ok(false);
        }

        match kind {
            LockKind::Exclusive => {
                let count = slot.exclusive.as_ref().map_or(0, |(_, count)| *count);
                slot.exclusive = Some((holder.to_string(), count + 1));
            }
            LockKind::Shared => {
                *slot.shared.entry(holder.to_string()).or_insert(0) += 1;
            }
        }
        Ok(true)
    }

    async fn release(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool> {
        self.ensure_available()?;
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&key) else {
            return Ok(false);
        };

        let released = match kind {
            LockKind::Exclusive => match slot.exclusive.take() {
                Some((owner, count)) if owner == holder => {
                    if count > 1 {
                        slot.exclusive = Some((owner, count - 1));
                    }
                    true
                }
                other => {
                    slot.exclusive = other;
                    false
                }
            },
            LockKind::Shared => match slot.shared.get_mut(holder) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    true
                }
                Some(_) => {
                    slot.shared.remove(holder);
                    true
                }
                None => false,
            },
        };

        if slot.is_free() {
            slots.remove(&key);
        }
        Ok(released)
    }

    async fn is_locked(&self, key: i64, kind: Option<LockKind>) -> Result<bool> {
        self.ensure_available()?;
        let slots = self.slots.lock().await;
        Ok(slots.get(&key).is_some_and(|slot| match kind {
            Some(LockKind::Exclusive) => slot.exclusive.is_some(),
            Some(LockKind::Shared) => !slot.shared.is_empty(),
            None => !slot.is_free(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_blocks_other_holder() -> Result<()> {
        let backend = MemoryAdvisoryBackend::new();
        assert!(backend.try_acquire("a", 7, LockKind::Exclusive).await?);
        assert!(!backend.try_acquire("b", 7, LockKind::Exclusive).await?);
        assert!(!backend.try_acquire("b", 7, LockKind::Shared).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_holders_coexist_and_block_exclusive() -> Result<()> {
        let backend = MemoryAdvisoryBackend::new();
        assert!(backend.try_acquire("a", 7, LockKind::Shared).await?);
        assert!(backend.try_acquire("b", 7, LockKind::Shared).await?);
        assert!(!backend.try_acquire("c", 7, LockKind::Exclusive).await?);

        assert!(backend.release("a", 7, LockKind::Shared).await?);
        assert!(!backend.try_acquire("c", 7, LockKind::Exclusive).await?);
        assert!(backend.release("b", 7, LockKind::Shared).await?);
        assert!(backend.try_acquire("c", 7, LockKind::Exclusive).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_reentrant_per_holder() -> Result<()> {
        let backend = MemoryAdvisoryBackend::new();
        assert!(backend.try_acquire("a", 1, LockKind::Exclusive).await?);
        assert!(backend.try_acquire("a", 1, LockKind::Exclusive).await?);
        assert!(backend.release("a", 1, LockKind::Exclusive).await?);
        assert!(backend.is_locked(1, Some(LockKind::Exclusive)).await?);
        assert!(backend.release("a", 1, LockKind::Exclusive).await?);
        assert!(!backend.is_locked(1, None).await?);
        assert_eq!(backend.held_key_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_by_non_holder_returns_false() -> Result<()> {
        let backend = MemoryAdvisoryBackend::new();
        assert!(backend.try_acquire("a", 3, LockKind::Exclusive).await?);
        assert!(!backend.release("b", 3, LockKind::Exclusive).await?);
        assert!(!backend.release("a", 99, LockKind::Shared).await?);
        assert!(backend.is_locked(3, Some(LockKind::Exclusive)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let backend = MemoryAdvisoryBackend::new();
        backend.set_available(false);
        let result = backend.try_acquire("a", 3, LockKind::Exclusive).await;
        assert!(matches!(result, Err(Error::Database(_))));
    }
}
