//! PostgreSQL backing store.
//!
//! Advisory locks are session-scoped in PostgreSQL, so every holder pins one
//! pooled connection from its first successful acquisition until release.
//! Keys fit in 32 bits, which puts them in `pg_locks` as `classid = 0`,
//! `objid = key`, `objsubid = 1`.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{collections::HashMap, time::Duration};

use sqlx::{pool::PoolConnection, postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::{
    lock::{AdvisoryBackend, LockKind},
    transaction::{IsolationLevel, StorageTransaction, TransactionBackend},
    Result,
};

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ADVISORY LOCKS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PgAdvisoryBackend {
    pool: PgPool,
    sessions: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl std::fmt::Debug for PgAdvisoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAdvisoryBackend")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PgAdvisoryBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Connections currently pinned by lock holders.
    pub async fn pinned_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The holder's pinned connection, or a fresh one. The flag is true when pinned.
    async fn session_for(&self, holder: &str) -> Result<(PoolConnection<Postgres>, bool)> {
        if let Some(conn) = self.sessions.lock().await.remove(holder) {
            return Ok((conn, true));
        }
        Ok((self.pool.acquire().await?, false))
    }
}

const fn lock_mode_name(kind: LockKind) -> &'static str {
    match kind {
        LockKind::Exclusive => "ExclusiveLock",
        LockKind::Shared => "ShareLock",
    }
}

#[async_trait::async_trait]
impl AdvisoryBackend for PgAdvisoryBackend {
    async fn try_acquire(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool> {
        let sql = match kind {
            LockKind::Exclusive => "SELECT pg_try_advisory_lock($1)",
            LockKind::Shared => "SELECT pg_try_advisory_lock_shared($1)",
        };

        let (mut conn, reused) = self.session_for(holder).await?;
        let acquired: bool = sqlx::query_scalar(sql)
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if acquired || reused {
            self.sessions.lock().await.insert(holder.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, holder: &str, key: i64, kind: LockKind) -> Result<bool> {
        let Some(mut conn) = self.sessions.lock().await.remove(holder) else {
            return Ok(false);
        };
        let sql = match kind {
            LockKind::Exclusive => "SELECT pg_advisory_unlock($1)",
            LockKind::Shared => "SELECT pg_advisory_unlock_shared($1)",
        };

        match sqlx::query_scalar::<_, bool>(sql)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(released) => Ok(released),
            Err(e) => {
                // Keep the session: its lock is still held and a later release may succeed.
                self.sessions.lock().await.insert(holder.to_string(), conn);
                Err(e.into())
            }
        }
    }

    async fn is_locked(&self, key: i64, kind: Option<LockKind>) -> Result<bool> {
        let locked: bool = match kind {
            Some(kind) => {
                sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM pg_locks \
                     WHERE locktype = 'advisory' AND classid = 0 \
                     AND objid = $1::bigint::oid AND objsubid = 1 \
                     AND granted AND mode = $2)",
                )
                .bind(key)
                .bind(lock_mode_name(kind))
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM pg_locks \
                     WHERE locktype = 'advisory' AND classid = 0 \
                     AND objid = $1::bigint::oid AND objsubid = 1 AND granted)",
                )
                .bind(key)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(locked)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TRANSACTIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct PgTransactionBackend {
    pool: PgPool,
}

impl PgTransactionBackend {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TransactionBackend for PgTransactionBackend {
    async fn begin(
        &self,
        isolation: IsolationLevel,
        statement_timeout: Duration,
    ) -> Result<Box<dyn StorageTransaction>> {
        let mut tx = self.pool.begin().await?;

        let set_isolation = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&set_isolation).execute(&mut *tx).await?;

        let set_timeout = format!(
            "SET LOCAL statement_timeout = '{}ms'",
            statement_timeout.as_millis()
        );
        sqlx::query(&set_timeout).execute(&mut *tx).await?;

        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StorageTransaction for PgTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let outcome = sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(outcome.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_transaction_futures_are_send() -> Result<()> {
        // Lazy pool: nothing connects unless a future is polled.
        let pool = sqlx::PgPool::connect_lazy("postgres://caseguard@localhost/caseguard")?;
        let backend = PgTransactionBackend::new(pool);
        let begin = backend.begin(IsolationLevel::Serializable, Duration::from_secs(1));
        assert_send(&begin);
        Ok(())
    }

    #[test]
    fn test_pg_lock_mode_names() {
        assert_eq!(lock_mode_name(LockKind::Exclusive), "ExclusiveLock");
        assert_eq!(lock_mode_name(LockKind::Shared), "ShareLock");
    }
}
