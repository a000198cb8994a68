//! # Caseguard Core
//!
//! Coordination for shared legal-case entities: typed advisory locks,
//! storage transactions bound to those locks, and a background job queue that
//! serializes work per entity.
//!
//! ## Layers
//!
//! - [`lock::AdvisoryLockService`]: timeout-bounded exclusive, shared and
//!   update locks over a backing store's advisory lock primitive.
//! - [`transaction::TransactionManager`]: runs closures inside a storage
//!   transaction, acquires multi-entity lock sets in a global order and
//!   always releases them.
//! - [`queue::QueueManager`]: priority, dependency gating, bounded concurrency
//!   and linear retry backoff; every attempt holds an exclusive lock on its
//!   entity.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Lock contention inside
//! the `with_*` helpers surfaces as [`Error::LockUnavailable`]; check
//! [`Error::is_contention`] to map it to a "resource busy" response.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
mod error;
pub mod lock;
pub mod maintenance;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod transaction;

pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use lock::{AdvisoryLockService, LockInfo, LockMode, LockOptions, LockType};
pub use queue::{JobStatus, JobType, NewJob, QueueJob, QueueManager};
pub use transaction::{
    EntityLock, IsolationLevel, TransactionHandle, TransactionManager, TransactionOptions,
};
