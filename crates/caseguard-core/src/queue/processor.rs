//! Job processor trait.

use std::future::Future;

use serde_json::Value;

use super::job::QueueJob;
use crate::transaction::TransactionHandle;

/// Everything a processor gets for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: QueueJob,
    /// Transaction holding the exclusive lock on the job's entity.
    pub transaction: TransactionHandle,
}

/// Handles jobs of one [`JobType`](super::JobType).
///
/// An `Err` (or a panic) is a failed attempt and goes through the retry
/// policy. The `Ok` value is stored verbatim as the job result.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value> {
        self(ctx).await
    }
}
