//! Lock identity and metadata types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Category of entity that can be locked.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockType {
    Case,
    Evidence,
    Document,
    User,
    Workflow,
    Analysis,
    VectorIndex,
    ChainOfCustody,
}

/// Concurrency discipline requested for a lock.
///
/// On one entity's base key, `Exclusive` excludes every other holder and
/// `Shared` holders coexist with each other only. `Update` lives on
/// `key + 1`, so it excludes other `Update` holders and nothing else.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockMode {
    #[default]
    Exclusive,
    Shared,
    /// Single-writer variant held as a second exclusive lock on `key + 1`.
    Update,
}

impl LockMode {
    /// Whether this mode excludes every other holder on the base key.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

/// Metadata for a lock held by this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Generated lock identifier; also the backend holder identity.
    pub lock_id: String,
    pub entity_type: LockType,
    pub entity_id: String,
    pub mode: LockMode,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    /// Acquisition time plus the acquisition timeout.
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<Map<String, Value>>,
}

impl LockInfo {
    /// Check whether the lock outlived its expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Options for a single lock acquisition.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Total time to keep polling. Falls back to the service default.
    pub timeout: Option<Duration>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl LockOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Summary of a lock registry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockHealth {
    /// Entries in the registry when the sweep started.
    pub active: usize,
    /// Entries past their expiry.
    pub expired: usize,
    /// Expired entries actually released.
    pub cleaned: usize,
}
