//! Advisory locking for typed entities.

pub mod backend;
pub mod key;
pub mod memory;
pub mod service;
pub mod types;

pub use backend::AdvisoryBackend;
pub use key::{backend_target, lock_key, LockKind};
pub use memory::MemoryAdvisoryBackend;
pub use service::AdvisoryLockService;
pub use types::{LockHealth, LockInfo, LockMode, LockOptions, LockType};
