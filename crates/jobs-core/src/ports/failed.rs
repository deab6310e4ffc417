//! Failed-job hook.

use async_trait::async_trait;

use crate::domain::{Job, JobsError, PipelineName};

/// Notified once for every job that leaves its pipeline without succeeding.
#[async_trait]
pub trait FailedJobHandler: Send + Sync {
    /// `target` is the dead-letter pipeline the copy went to, `None` when the
    /// job was discarded.
    async fn handle(&self, job: &Job, target: Option<&PipelineName>, reason: &str);
}

/// Default hook: one structured error log per failed job.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFailedJobHandler;

#[async_trait]
impl FailedJobHandler for LogFailedJobHandler {
    async fn handle(&self, job: &Job, target: Option<&PipelineName>, reason: &str) {
        let err = JobsError::DeadLettered {
            job_id: job.id(),
            attempts: job.attempts(),
            target: target.cloned(),
            reason: reason.to_string(),
        };
        match target {
            Some(target) => tracing::error!(
                pipeline = %job.pipeline(),
                job_id = %job.id(),
                dead_letter = %target,
                error = %err,
                "job moved to dead-letter pipeline"
            ),
            None => tracing::error!(
                pipeline = %job.pipeline(),
                job_id = %job.id(),
                error = %err,
                "job discarded after failing"
            ),
        }
    }
}
