//! Queue job model and admission rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{config::QueueConfig, lock::LockType, Error, Result};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const MAX_RETRIES: u32 = 10;
pub const MAX_JOB_TIMEOUT_MS: u64 = 10 * 60 * 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ENUMS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Kinds of background work.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    EvidenceAnalysis,
    DocumentProcessing,
    CaseSynthesis,
    ChainOfCustodyUpdate,
    VectorIndexRebuild,
    AiTraining,
    ReportGeneration,
}

/// Where a job currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    NotFound,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JOBS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An admitted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub entity_type: LockType,
    pub entity_id: String,
    /// 1-10, higher runs first.
    pub priority: u8,
    pub payload: Map<String, Value>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// Not-before time; set by retry backoff.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Jobs that must complete before this one may start.
    pub dependencies: Vec<Uuid>,
    pub metadata: Option<Map<String, Value>>,
    /// When the current attempt was dispatched.
    pub started_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Dispatch time plus timeout, for cooperative cancellation checks.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.timeout()).ok()?;
        self.started_at.map(|started| started + timeout)
    }

    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Ready when not deferred into the future.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }
}

/// A job as submitted, before defaults and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub entity_type: LockType,
    pub entity_id: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl NewJob {
    pub fn new(job_type: JobType, entity_type: LockType, entity_id: impl Into<String>) -> Self {
        Self {
            job_type,
            entity_type,
            entity_id: entity_id.into(),
            priority: None,
            payload: Map::new(),
            user_id: None,
            session_id: None,
            timeout_ms: None,
            max_retries: None,
            scheduled_for: None,
            dependencies: Vec::new(),
            metadata: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
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
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub const fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = Uuid>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate, fill defaults and assign an id.
    pub fn admit(self, defaults: &QueueConfig) -> Result<QueueJob> {
        let entity_id = self.entity_id.trim();
        if entity_id.is_empty() {
            return Err(Error::Validation("entityId must not be empty".into()));
        }

        let priority = self.priority.unwrap_or(defaults.default_priority);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::Validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
            )));
        }

        let timeout_ms = self.timeout_ms.unwrap_or(defaults.default_timeout_ms);
        if timeout_ms == 0 || timeout_ms > MAX_JOB_TIMEOUT_MS {
            return Err(Error::Validation(format!(
                "timeout must be between 1 and {MAX_JOB_TIMEOUT_MS}ms, got {timeout_ms}"
            )));
        }

        let max_retries = self.max_retries.unwrap_or(defaults.default_max_retries);
        if max_retries > MAX_RETRIES {
            return Err(Error::Validation(format!(
                "maxRetries must be at most {MAX_RETRIES}, got {max_retries}"
            )));
        }

        Ok(QueueJob {
            id: Uuid::new_v4(),
            job_type: self.job_type,
            entity_type: self.entity_type,
            entity_id: entity_id.to_string(),
            priority,
            payload: self.payload,
            user_id: self.user_id,
            session_id: self.session_id,
            timeout_ms,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            scheduled_for: self.scheduled_for,
            dependencies: self.dependencies,
            metadata: self.metadata,
            started_at: None,
        })
    }
}

/// How a finished job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { result: Value },
    Failed { error: String },
}

/// A job that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedJob {
    pub job: QueueJob,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

impl FinishedJob {
    /// Creation-to-finish time.
    #[must_use]
    pub fn processing_time(&self) -> chrono::Duration {
        self.finished_at - self.job.created_at
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_admit_fills_defaults() -> Result<()> {
        let job = NewJob::new(JobType::CaseSynthesis, LockType::Case, " C1 ")
            .admit(&QueueConfig::default())?;
        assert_eq!(job.entity_id, "C1");
        assert_eq!(job.priority, 5);
        assert_eq!(job.timeout_ms, 30_000);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());
        assert!(job.deadline().is_none());
        Ok(())
    }

    #[test]
    fn test_admit_rejects_bad_input() {
        let defaults = QueueConfig::default();
        let cases = [
            NewJob::new(JobType::AiTraining, LockType::Analysis, "  "),
            NewJob::new(JobType::AiTraining, LockType::Analysis, "A1").with_priority(0),
            NewJob::new(JobType::AiTraining, LockType::Analysis, "A1").with_priority(11),
            NewJob::new(JobType::AiTraining, LockType::Analysis, "A1").with_max_retries(11),
            NewJob::new(JobType::AiTraining, LockType::Analysis, "A1")
                .with_timeout(Duration::ZERO),
        ];
        for job in cases {
            assert!(matches!(job.admit(&defaults), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_json_shape() -> Result<()> {
        let job: NewJob = serde_json::from_value(json!({
            "type": "evidence_analysis",
            "entityType": "evidence",
            "entityId": "E1",
            "priority": 8,
            "timeout": 5000,
            "payload": { "pages": 3 }
        }))?;
        assert_eq!(job.job_type, JobType::EvidenceAnalysis);
        assert_eq!(job.timeout_ms, Some(5000));
        assert_eq!(job.payload.get("pages"), Some(&json!(3)));

        let unknown: std::result::Result<NewJob, _> = serde_json::from_value(json!({
            "type": "teleport",
            "entityType": "evidence",
            "entityId": "E1"
        }));
        assert!(unknown.is_err());
        Ok(())
    }

    #[test]
    fn test_deadline_follows_dispatch() -> Result<()> {
        let mut job = NewJob::new(JobType::ReportGeneration, LockType::Case, "C1")
            .with_timeout(Duration::from_secs(2))
            .admit(&QueueConfig::default())?;
        let started = Utc::now();
        job.started_at = Some(started);
        assert_eq!(job.deadline(), Some(started + chrono::Duration::seconds(2)));
        assert!(!job.is_past_deadline(started));
        assert!(job.is_past_deadline(started + chrono::Duration::seconds(3)));
        Ok(())
    }

    #[test]
    fn test_job_type_names() {
        assert_eq!(JobType::ChainOfCustodyUpdate.to_string(), "chain_of_custody_update");
        assert_eq!(
            JobType::from_str("vector_index_rebuild").ok(),
            Some(JobType::VectorIndexRebuild)
        );
        assert_eq!(JobStatus::NotFound.to_string(), "not_found");
    }
}
