//! Queue manager.
//!
//! Jobs move `pending -> processing -> completed`, back to `pending` for a
//! retry, or to `failed`. A periodic tick dispatches ready jobs (dependencies
//! completed, not deferred) highest priority first, bounded by a semaphore of
//! `max_concurrent_jobs` permits. Every attempt runs inside an exclusive lock
//! on the job's entity, so two jobs touching the same entity never overlap.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
    job::{FinishedJob, JobOutcome, JobStatus, JobType, NewJob, QueueJob},
    processor::{JobContext, JobProcessor},
};
use crate::{
    config::QueueConfig,
    lock::LockMode,
    transaction::{TransactionManager, TransactionOptions},
    Result,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REPORTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed plus failed.
    pub throughput: usize,
    /// Mean creation-to-completion time over completed jobs.
    pub average_processing_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub stats: QueueStats,
    pub issues: Vec<String>,
    /// Finished records dropped by retention cleanup.
    pub cleaned: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MANAGER
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct QueueState {
    pending: HashMap<Uuid, QueueJob>,
    processing: HashMap<Uuid, QueueJob>,
    completed: HashMap<Uuid, FinishedJob>,
    failed: HashMap<Uuid, FinishedJob>,
}

impl QueueState {
    fn find(&self, job_id: &Uuid) -> Option<(JobStatus, &QueueJob)> {
        self.pending
            .get(job_id)
            .map(|job| (JobStatus::Pending, job))
            .or_else(|| self.processing.get(job_id).map(|job| (JobStatus::Processing, job)))
            .or_else(|| {
                self.completed
                    .get(job_id)
                    .map(|done| (JobStatus::Completed, &done.job))
            })
            .or_else(|| self.failed.get(job_id).map(|done| (JobStatus::Failed, &done.job)))
    }

    fn is_known(&self, job_id: &Uuid) -> bool {
        self.find(job_id).is_some()
    }

    fn stats(&self) -> QueueStats {
        let total_ms: i64 = self
            .completed
            .values()
            .map(|done| done.processing_time().num_milliseconds())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let average_processing_ms = if self.completed.is_empty() {
            0.0
        } else {
            total_ms as f64 / self.completed.len() as f64
        };

        QueueStats {
            pending: self.pending.len(),
            processing: self.processing.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            throughput: self.completed.len() + self.failed.len(),
            average_processing_ms,
        }
    }
}

/// Background job queue. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct QueueManager {
    transactions: TransactionManager,
    processors: Arc<RwLock<HashMap<JobType, Arc<dyn JobProcessor>>>>,
    state: Arc<Mutex<QueueState>>,
    slots: Arc<Semaphore>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: QueueConfig,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.config)
            .field("free_slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(transactions: TransactionManager) -> Self {
        Self::with_config(transactions, QueueConfig::default())
    }

    pub fn with_config(transactions: TransactionManager, config: QueueConfig) -> Self {
        Self {
            transactions,
            processors: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(Mutex::new(QueueState::default())),
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            ticker: Arc::new(Mutex::new(None)),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Install the handler for `job_type`, replacing any previous one.
    pub async fn register_processor<P>(&self, job_type: JobType, processor: P)
    where
        P: JobProcessor + 'static,
    {
        self.processors
            .write()
            .await
            .insert(job_type, Arc::new(processor));
        tracing::debug!(job_type = %job_type, "Processor registered");
    }

    /// Validate and admit a job. Dependencies are only checked at dispatch.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Uuid> {
        let job = new_job.admit(&self.config)?;
        let job_id = job.id;

        let mut state = self.state.lock().await;
        let waiting_on = job
            .dependencies
            .iter()
            .filter(|dep| !state.completed.contains_key(dep))
            .count();
        if waiting_on > 0 {
            tracing::debug!(job_id = %job_id, waiting_on, "Job waiting on dependencies");
        }
        tracing::info!(
            job_id = %job_id,
            job_type = %job.job_type,
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            priority = job.priority,
            "Job enqueued"
        );
        state.pending.insert(job_id, job);
        Ok(job_id)
    }

    /// Admit a job from untyped JSON (`type`, `entityType`, `entityId`, ...).
    pub async fn enqueue_json(&self, value: Value) -> Result<Uuid> {
        let new_job: NewJob = serde_json::from_value(value)?;
        self.enqueue(new_job).await
    }

    /// Start the periodic tick. No-op when already running.
    pub async fn start(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let manager = self.clone();
        let period = self.config.tick_interval();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.run_tick().await;
            }
        }));
        tracing::info!(tick_ms = period.as_millis(), "Queue started");
    }

    /// Stop the tick. In-flight jobs keep running.
    pub async fn stop(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
            tracing::info!("Queue stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the tick and wait up to `grace` for in-flight jobs.
    ///
    /// Returns how many jobs were still processing when the wait ended.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.stop().await;
        let deadline = Instant::now() + grace;
        loop {
            let processing = self.state.lock().await.processing.len();
            if processing == 0 || Instant::now() >= deadline {
                if processing > 0 {
                    tracing::warn!(processing, "Drain grace period elapsed with jobs in flight");
                }
                return processing;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// One scheduling pass. Returns how many jobs were dispatched.
    ///
    /// Jobs of a type with no processor fail here without taking a slot.
    pub async fn run_tick(&self) -> usize {
        let processors = self.processors.read().await.clone();
        let now = Utc::now();
        let mut dispatched: Vec<(QueueJob, Arc<dyn JobProcessor>, OwnedSemaphorePermit)> = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let ready: Vec<Uuid> = state
                .pending
                .values()
                .filter(|job| job.is_due(now))
                .filter(|job| job.dependencies.iter().all(|dep| state.completed.contains_key(dep)))
                .sorted_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                })
                .map(|job| job.id)
                .collect();

            for job_id in ready {
                let Some(mut job) = state.pending.remove(&job_id) else {
                    continue;
                };

                let Some(processor) = processors.get(&job.job_type) else {
                    let error = format!("No processor registered for job type {}", job.job_type);
                    tracing::error!(job_id = %job.id, job_type = %job.job_type, "{error}");
                    state.failed.insert(
                        job_id,
                        FinishedJob {
                            job,
                            outcome: JobOutcome::Failed { error },
                            finished_at: now,
                        },
                    );
                    continue;
                };

                let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                    state.pending.insert(job_id, job);
                    continue;
                };

                job.started_at = Some(now);
                state.processing.insert(job_id, job.clone());
                dispatched.push((job, Arc::clone(processor), permit));
            }
        }

        let count = dispatched.len();
        for (job, processor, permit) in dispatched {
            tracing::debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                priority = job.priority,
                retry_count = job.retry_count,
                "Job dispatched"
            );
            let manager = self.clone();
            tokio::spawn(async move {
                manager.execute(job, processor).await;
                drop(permit);
            });
        }
        count
    }

    async fn execute(&self, job: QueueJob, processor: Arc<dyn JobProcessor>) {
        let mut options = TransactionOptions::new().with_timeout(job.timeout());
        options.user_id.clone_from(&job.user_id);
        options.session_id.clone_from(&job.session_id);

        let attempt_job = job.clone();
        let attempt = self.transactions.with_transaction_and_lock(
            job.entity_type,
            &job.entity_id,
            LockMode::Exclusive,
            options,
            move |transaction| async move {
                processor
                    .process(JobContext {
                        job: attempt_job,
                        transaction,
                    })
                    .await
            },
        );

        let outcome = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };
        self.settle(job, outcome).await;
    }

    async fn settle(&self, mut job: QueueJob, outcome: std::result::Result<Value, String>) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.processing.remove(&job.id);

        match outcome {
            Ok(result) => {
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                state.completed.insert(
                    job.id,
                    FinishedJob {
                        job,
                        outcome: JobOutcome::Completed { result },
                        finished_at: now,
                    },
                );
            }
            Err(error) if job.retry_count < job.max_retries => {
                job.retry_count += 1;
                job.started_at = None;
                job.scheduled_for = Some(self.backoff_until(now, job.retry_count));
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    error = %error,
                    "Job failed; retry scheduled"
                );
                state.pending.insert(job.id, job);
            }
            Err(error) => {
                tracing::error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    error = %error,
                    "Job failed permanently"
                );
                state.failed.insert(
                    job.id,
                    FinishedJob {
                        job,
                        outcome: JobOutcome::Failed { error },
                        finished_at: now,
                    },
                );
            }
        }
    }

    /// Linear backoff: `retry_count * retry_backoff`.
    fn backoff_until(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        Duration::from_millis(self.config.retry_backoff_ms)
            .checked_mul(retry_count)
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn get_stats(&self) -> QueueStats {
        self.state.lock().await.stats()
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> JobStatus {
        self.state
            .lock()
            .await
            .find(&job_id)
            .map_or(JobStatus::NotFound, |(status, _)| status)
    }

    /// Result or terminating error of a finished job.
    pub async fn get_job_result(&self, job_id: Uuid) -> Option<JobOutcome> {
        let state = self.state.lock().await;
        state
            .completed
            .get(&job_id)
            .or_else(|| state.failed.get(&job_id))
            .map(|done| done.outcome.clone())
    }

    /// Current record of a job in any state.
    pub async fn get_job(&self, job_id: Uuid) -> Option<QueueJob> {
        self.state
            .lock()
            .await
            .find(&job_id)
            .map(|(_, job)| job.clone())
    }

    /// Assess queue health and drop finished records past retention.
    pub async fn health_check(&self) -> QueueHealth {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let stats = state.stats();
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();

        #[allow(clippy::cast_precision_loss)]
        let failure_ratio_exceeded =
            stats.failed > 0 && stats.failed as f64 > stats.completed as f64 * 0.1;
        if failure_ratio_exceeded {
            status = status.max(HealthStatus::Degraded);
            issues.push(format!(
                "High failure rate: {} failed vs {} completed",
                stats.failed, stats.completed
            ));
        }

        for job in state.processing.values() {
            let limit = job.timeout().saturating_mul(self.config.stuck_multiplier);
            let running = job
                .started_at
                .and_then(|started| (now - started).to_std().ok())
                .unwrap_or_default();
            if running > limit {
                status = HealthStatus::Critical;
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    running_ms = running.as_millis(),
                    "Stuck job"
                );
                issues.push(format!(
                    "Job {} ({}) stuck for {}ms",
                    job.id,
                    job.job_type,
                    running.as_millis()
                ));
            }
        }

        for job in state.pending.values() {
            for dep in &job.dependencies {
                let problem = if state.failed.contains_key(dep) {
                    Some("failed")
                } else if state.is_known(dep) {
                    None
                } else {
                    Some("unknown")
                };
                if let Some(problem) = problem {
                    status = status.max(HealthStatus::Degraded);
                    issues.push(format!("Job {} waits on {problem} dependency {dep}", job.id));
                }
            }
        }

        let cleaned = chrono::Duration::from_std(self.config.retention())
            .ok()
            .map_or(0, |retention| {
                let cutoff = now - retention;
                let before = state.completed.len() + state.failed.len();
                state.completed.retain(|_, done| done.finished_at >= cutoff);
                state.failed.retain(|_, done| done.finished_at >= cutoff);
                before - state.completed.len() - state.failed.len()
            });

        QueueHealth {
            status,
            stats,
            issues,
            cleaned,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(
            || "processor panicked".to_string(),
            |msg| format!("processor panicked: {msg}"),
        )
}
