//! Background job queue.

pub mod job;
pub mod manager;
pub mod processor;

pub use job::{FinishedJob, JobOutcome, JobStatus, JobType, NewJob, QueueJob};
pub use manager::{HealthStatus, QueueHealth, QueueManager, QueueStats};
pub use processor::{JobContext, JobProcessor};
