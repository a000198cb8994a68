//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: `~/.config/caseguard/config.toml`
//! 3. Explicit config file passed by the caller
//! 4. Environment variables: `CASEGUARD_*`
//!
//! Files may be partial; missing keys keep the value from the layer below.
//!
//! # Example Config
//!
//! ```toml
//! [lock]
//! default_timeout_ms = 10000
//!
//! [transaction]
//! default_isolation = "repeatable-read"
//!
//! [queue]
//! max_concurrent_jobs = 8
//! retry_backoff_ms = 2000
//! ```

use std::{path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{transaction::IsolationLevel, Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub lock: LockConfig,
    pub transaction: TransactionConfig,
    pub queue: QueueConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// How long `acquire_lock` keeps polling when no timeout is given.
    pub default_timeout_ms: u64,
    /// Pause between try-lock attempts.
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransactionConfig {
    /// Statement timeout and lock timeout for ordinary transactions.
    pub default_timeout_ms: u64,
    /// Timeout for vector index transactions (rebuilds are long-running).
    pub vector_index_timeout_ms: u64,
    /// Age after which an active transaction is force-cleaned.
    pub max_age_secs: u64,
    pub default_isolation: IsolationLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    pub default_max_retries: u32,
    pub default_timeout_ms: u64,
    pub default_priority: u8,
    pub tick_interval_ms: u64,
    /// Linear backoff step: retry `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// How long completed and failed records are kept.
    pub retention_secs: u64,
    /// A processing job is stuck after `stuck_multiplier * timeout`.
    pub stuck_multiplier: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry_interval_ms: 100,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            vector_index_timeout_ms: 60_000,
            max_age_secs: 300,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            default_max_retries: 3,
            default_timeout_ms: 30_000,
            default_priority: 5,
            tick_interval_ms: 1_000,
            retry_backoff_ms: 5_000,
            retention_secs: 3_600,
            stuck_multiplier: 2,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DURATION ACCESSORS
// ═══════════════════════════════════════════════════════════════════════════

impl LockConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl TransactionConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn vector_index_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_index_timeout_ms)
    }

    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl MaintenanceConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration from all layers.
///
/// # Errors
///
/// Returns error if:
/// - A config file is malformed TOML
/// - An environment variable holds an unparsable value
/// - The merged config fails validation
pub async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_tables(&mut merged, load_toml_file(&global_path).await?);
        }
    }

    if let Some(path) = explicit {
        merge_tables(&mut merged, load_toml_file(path).await?);
    }

    let mut config: Config = toml::Value::Table(merged).try_into()?;
    config.apply_env_vars()?;
    config.validate()?;
    Ok(config)
}

/// Path to the global config file, if a home directory is known.
fn global_config_path() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("", "", "caseguard")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

async fn load_toml_file(path: &Path) -> Result<toml::Table> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("Failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents).map_err(Error::from)
}

/// Recursively overlay `overlay` onto `base`.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value: {e}")))?;
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    fn apply_env_vars(&mut self) -> Result<()> {
        env_override("CASEGUARD_LOCK_TIMEOUT_MS", &mut self.lock.default_timeout_ms)?;
        env_override(
            "CASEGUARD_LOCK_RETRY_INTERVAL_MS",
            &mut self.lock.retry_interval_ms,
        )?;

        env_override(
            "CASEGUARD_TRANSACTION_TIMEOUT_MS",
            &mut self.transaction.default_timeout_ms,
        )?;
        env_override(
            "CASEGUARD_VECTOR_INDEX_TIMEOUT_MS",
            &mut self.transaction.vector_index_timeout_ms,
        )?;
        env_override(
            "CASEGUARD_TRANSACTION_MAX_AGE_SECS",
            &mut self.transaction.max_age_secs,
        )?;
        env_override(
            "CASEGUARD_TRANSACTION_ISOLATION",
            &mut self.transaction.default_isolation,
        )?;

        env_override(
            "CASEGUARD_QUEUE_MAX_CONCURRENT_JOBS",
            &mut self.queue.max_concurrent_jobs,
        )?;
        env_override(
            "CASEGUARD_QUEUE_MAX_RETRIES",
            &mut self.queue.default_max_retries,
        )?;
        env_override(
            "CASEGUARD_QUEUE_JOB_TIMEOUT_MS",
            &mut self.queue.default_timeout_ms,
        )?;
        env_override(
            "CASEGUARD_QUEUE_TICK_INTERVAL_MS",
            &mut self.queue.tick_interval_ms,
        )?;
        env_override(
            "CASEGUARD_QUEUE_RETRY_BACKOFF_MS",
            &mut self.queue.retry_backoff_ms,
        )?;
        env_override(
            "CASEGUARD_QUEUE_RETENTION_SECS",
            &mut self.queue.retention_secs,
        )?;

        env_override(
            "CASEGUARD_MAINTENANCE_INTERVAL_MS",
            &mut self.maintenance.interval_ms,
        )?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("lock.default_timeout_ms", self.lock.default_timeout_ms),
            ("lock.retry_interval_ms", self.lock.retry_interval_ms),
            (
                "transaction.default_timeout_ms",
                self.transaction.default_timeout_ms,
            ),
            (
                "transaction.vector_index_timeout_ms",
                self.transaction.vector_index_timeout_ms,
            ),
            ("transaction.max_age_secs", self.transaction.max_age_secs),
            ("queue.default_timeout_ms", self.queue.default_timeout_ms),
            ("queue.tick_interval_ms", self.queue.tick_interval_ms),
            ("maintenance.interval_ms", self.maintenance.interval_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be greater than 0")));
        }

        if self.queue.max_concurrent_jobs == 0 {
            return Err(Error::InvalidConfig(
                "queue.max_concurrent_jobs must be at least 1".into(),
            ));
        }

        if !(1..=10).contains(&self.queue.default_priority) {
            return Err(Error::InvalidConfig(format!(
                "queue.default_priority must be between 1 and 10, got {}",
                self.queue.default_priority
            )));
        }

        if self.queue.default_max_retries > 10 {
            return Err(Error::InvalidConfig(format!(
                "queue.default_max_retries must be at most 10, got {}",
                self.queue.default_max_retries
            )));
        }

        if self.queue.stuck_multiplier == 0 {
            return Err(Error::InvalidConfig(
                "queue.stuck_multiplier must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
