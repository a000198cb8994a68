//! Advisory Lock Backend Trait - abstraction boundary for the lock primitive.
//!
//! The backing store exposes session-scoped try-lock / unlock primitives keyed
//! by integers, separately for exclusive and shared modes, and a lock table
//! that can be queried for locks held by any session.
//!
//! Every acquisition is made on behalf of a `holder` (the generated lock id).
//! A holder plays the role of one database session: two holders contend with
//! each other exactly like two sessions would, even inside one process.

use super::key::LockKind;
use crate::Result;

#[async_trait::async_trait]
pub trait AdvisoryBackend: Send + Sync {
    /// Try once to take `kind` on `key` for `holder`. Never waits.
    async fn try_acquire(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool>;

    /// Release `kind` on `key` held by `holder`.
    ///
    /// Returns `false` when `holder` does not hold it.
    async fn release(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool>;

    /// Whether any session holds `key` (in `kind`, or in any kind when `None`).
    async fn is_locked(&self, key: i64, kind: Option<LockKind>) -> Result<bool>;
}
