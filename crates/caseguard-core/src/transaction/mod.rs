//! Storage transactions bound to advisory locks.

pub mod backend;
pub mod context;
pub mod isolation;
pub mod manager;
pub mod memory;

pub use backend::{StorageTransaction, TransactionBackend};
pub use context::{
    EntityLock, TransactionContext, TransactionHandle, TransactionOptions, TransactionState,
};
pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use memory::{MemoryTransactionBackend, TransactionLedger};
