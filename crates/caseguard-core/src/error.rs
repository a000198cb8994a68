//! Error types for caseguard-core
//!
//! Errors fall into three groups:
//!
//! - **Contention**: a lock could not be obtained within its timeout. This is
//!   expected in normal operation and callers should surface it as a
//!   "resource busy, try again" condition.
//! - **Backing store**: anything that went wrong talking to the storage engine.
//! - **Input**: invalid jobs or invalid configuration.

use thiserror::Error;

use crate::lock::{LockMode, LockType};

/// Core error type for caseguard operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A lock was not acquired within its timeout window
    #[error("Failed to acquire {mode} lock on {entity_type}:{entity_id} within {waited_ms}ms")]
    LockUnavailable {
        entity_type: LockType,
        entity_id: String,
        mode: LockMode,
        waited_ms: u64,
    },

    /// Backing store connectivity or protocol failure
    #[error("Database error: {0}")]
    Database(String),

    /// Malformed job data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A transaction handle was used after its transaction ended
    #[error("Transaction {0} is no longer open")]
    TransactionClosed(String),

    /// IO failure while reading configuration
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LockUnavailable { .. } => "LOCK_UNAVAILABLE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::TransactionClosed(_) => "TRANSACTION_CLOSED",
            Self::Io(_) => "IO_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
        }
    }

    /// Whether this error means "resource busy" rather than a fault.
    ///
    /// HTTP layers map this to 409/423 instead of 500.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::LockUnavailable { .. })
    }

    pub(crate) fn lock_unavailable(
        entity_type: LockType,
        entity_id: impl Into<String>,
        mode: LockMode,
        waited: std::time::Duration,
    ) -> Self {
        Self::LockUnavailable {
            entity_type,
            entity_id: entity_id.into(),
            mode,
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(format!("Failed to parse config: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Result type alias for caseguard-core operations
pub type Result<T> = std::result::Result<T, Error>;
