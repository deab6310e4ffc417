//! Broker port - バックエンド（AMQP / SQS / Beanstalk / ephemeral）の抽象化
//!
//! 1 つの Broker インスタンスは 1 つの pipeline を担当します。
//! reserve したジョブは `Delivery` として consumer に渡され、
//! `ack` / `nack` を呼ぶと Delivery は消費されます（二重解決はコンパイル時に防がれる）。

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::domain::{BrokerStat, DeliveryId, Job, JobId, JobsError, PipelineName};

/// A reserved, unacknowledged job.
///
/// The consumer that received it owns it exclusively until it is resolved.
/// Dropping a delivery without resolving it abandons the reservation; the
/// broker's own timeout makes the job eligible again.
#[async_trait]
pub trait Delivery: Send {
    fn id(&self) -> DeliveryId;

    fn job(&self) -> &Job;

    /// Remove the job from the pipeline.
    async fn ack(self: Box<Self>) -> Result<(), JobsError>;

    /// Return the job to the pipeline with one more failed attempt; it
    /// becomes eligible again after `delay`.
    async fn nack(self: Box<Self>, delay: Duration) -> Result<(), JobsError>;
}

/// What a `consume` handler wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack(Duration),
}

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Callback used by [`Broker::consume`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Reply, HandlerError>;
}

/// Broker は pipeline 1 本分のジョブを保持し、1 件ずつ配送する
///
/// # 契約
/// - `push` は `delay_until` を尊重する
/// - `reserve` は `wait` まで待って、遅延の明けたジョブを 1 件返す（なければ `None`）
/// - 1 件のジョブは同時に 1 つの consumer にしか見えない（at-least-once）
/// - `stat` は best-effort
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name ("ephemeral", "amqp", ...).
    fn driver(&self) -> &'static str;

    fn pipeline(&self) -> &PipelineName;

    /// Connection check run at startup.
    async fn check(&self) -> Result<(), JobsError>;

    async fn push(&self, job: Job) -> Result<JobId, JobsError>;

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError>;

    async fn stat(&self) -> Result<BrokerStat, JobsError>;

    /// Called once the pipeline's consumers have stopped. Backends that
    /// prefetch hand buffered, never-delivered jobs back here.
    async fn pause(&self) -> Result<(), JobsError> {
        Ok(())
    }

    /// Release connections.
    async fn stop(&self) -> Result<(), JobsError>;

    /// Run `handler` for every delivery until `cancel` fires, waiting at
    /// most `wait` per reserve.
    ///
    /// A handler error counts as `Nack` with the job's computed backoff while
    /// attempts remain; on the last attempt the job is acked and dropped.
    /// Transport errors back off and are retried; other broker errors end the loop.
    async fn consume(
        &self,
        wait: Duration,
        cancel: CancellationToken,
        handler: &dyn JobHandler,
    ) -> Result<(), JobsError> {
        let mut failures: u32 = 0;

        loop {
            let reserved = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                reserved = self.reserve(wait) => reserved,
            };

            let delivery = match reserved {
                Ok(Some(delivery)) => {
                    failures = 0;
                    delivery
                }
                Ok(None) => continue,
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let pause = reconnect_delay(failures);
                    tracing::warn!(
                        pipeline = %self.pipeline(),
                        error = %err,
                        retry_in = ?pause,
                        "reserve failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
                Err(err) => return Err(err),
            };

            let job = delivery.job();
            let job_id = job.id();
            let reply = if job.is_exhausted() {
                tracing::error!(
                    pipeline = %self.pipeline(),
                    %job_id,
                    attempts = job.attempts(),
                    "delivered with no attempts left, dropping"
                );
                Reply::Ack
            } else {
                match handler.handle(job).await {
                    Ok(reply) => reply,
                    Err(err) if job.attempts() + 1 >= job.max_attempts() => {
                        tracing::error!(
                            pipeline = %self.pipeline(),
                            %job_id,
                            attempts = job.attempts() + 1,
                            error = %err,
                            "handler failed on the last attempt, dropping"
                        );
                        Reply::Ack
                    }
                    Err(err) => {
                        tracing::warn!(pipeline = %self.pipeline(), %job_id, error = %err, "handler failed");
                        Reply::Nack(job.retry().next_delay(job.attempts()))
                    }
                }
            };

            let resolved = match reply {
                Reply::Ack => delivery.ack().await,
                Reply::Nack(delay) => delivery.nack(delay).await,
            };
            match resolved {
                Ok(()) => {}
                Err(JobsError::HandleExpired { delivery, .. }) => {
                    tracing::warn!(pipeline = %self.pipeline(), %job_id, %delivery, "delivery handle expired");
                }
                Err(err) => {
                    tracing::warn!(pipeline = %self.pipeline(), %job_id, error = %err, "resolving delivery failed");
                }
            }
        }
    }
}

/// Builds the broker for a pipeline from its configuration.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn build(&self, config: &PipelineConfig) -> Result<Arc<dyn Broker>, JobsError>;
}

/// Backoff between failed reserve calls: 100ms doubling up to 30s.
pub fn reconnect_delay(failures: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const MAX: Duration = Duration::from_secs(30);

    let shift = failures.saturating_sub(1).min(16);
    Duration::from_millis(BASE_MS.saturating_mul(1 << shift)).min(MAX)
}
