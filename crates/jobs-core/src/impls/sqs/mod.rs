//! SQS broker
//!
//! - ack = `DeleteMessage`（receipt handle が delivery handle）
//! - visibility timeout が ack の期限
//! - 遅延は `DelaySeconds`（最大 15 分）。それより長い遅延は受信時に判定し、
//!   早すぎたメッセージは残り時間で送り直して元を削除する
//! - nack は 2 通り: `republish`（attempt を増やしたコピーを遅延送信して元を削除）/
//!   `visibility`（visibility timeout を delay に変更。attempt は ApproximateReceiveCount から復元）

#[cfg(feature = "sqs")]
mod aws;

#[cfg(feature = "sqs")]
pub use self::aws::AwsSqsTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::transport::TransportError;
use crate::domain::{BrokerStat, DeliveryId, Job, JobId, JobsError, PipelineName};
use crate::ports::{Broker, Clock, Delivery, SystemClock};

pub const DRIVER: &str = "sqs";

/// Largest `DelaySeconds` SQS accepts.
pub const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Largest visibility timeout SQS accepts.
pub const MAX_VISIBILITY: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest long-poll SQS accepts.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackMode {
    /// Send an updated copy with the retry delay, delete the original.
    #[default]
    Republish,
    /// Change the message visibility to the retry delay.
    Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsOptions {
    /// Queue name; defaults to the pipeline name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Skips the name lookup when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_url: Option<String>,

    /// Create the queue if the lookup finds nothing.
    pub create_queue: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint (e.g. a local SQS emulator).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Long-poll wait per receive call (capped at 20s).
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,

    pub max_payload: usize,

    pub nack_mode: NackMode,
}

impl Default for SqsOptions {
    fn default() -> Self {
        Self {
            queue: None,
            queue_url: None,
            create_queue: true,
            region: None,
            endpoint: None,
            visibility_timeout: Duration::from_secs(30),
            wait_time: MAX_WAIT,
            max_payload: 256 * 1024,
            nack_mode: NackMode::Republish,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqsMessage {
    pub receipt_handle: String,
    pub body: String,
    /// `ApproximateReceiveCount`, including this receipt.
    pub receive_count: u32,
}

/// Network side of the SQS broker.
#[async_trait]
pub trait SqsTransport: Send + Sync + 'static {
    /// Queue URL for `name`, creating the queue when `create` is set.
    async fn resolve_queue(&self, name: &str, create: bool) -> Result<String, TransportError>;

    async fn send(&self, queue_url: &str, body: String, delay: Duration)
    -> Result<(), TransportError>;

    /// Receive at most one message.
    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<SqsMessage>, TransportError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError>;

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Approximate visible / delayed / in-flight counts.
    async fn stat(&self, queue_url: &str) -> Result<BrokerStat, TransportError>;
}

struct SqsShared<T> {
    pipeline: PipelineName,
    queue: String,
    options: SqsOptions,
    transport: T,
    queue_url: OnceCell<String>,
    clock: Arc<dyn Clock>,
}

impl<T: SqsTransport> SqsShared<T> {
    fn err(&self, err: TransportError) -> JobsError {
        err.into_jobs(&self.pipeline)
    }

    async fn url(&self) -> Result<&str, JobsError> {
        self.queue_url
            .get_or_try_init(|| async {
                match &self.options.queue_url {
                    Some(url) => Ok(url.clone()),
                    None => self
                        .transport
                        .resolve_queue(&self.queue, self.options.create_queue)
                        .await
                        .map_err(|e| self.err(e)),
                }
            })
            .await
            .map(String::as_str)
    }

    fn encode(&self, job: &Job) -> Result<String, JobsError> {
        let body = String::from_utf8(job.to_wire()?)
            .map_err(|e| JobsError::Codec(e.to_string()))?;
        if body.len() > self.options.max_payload {
            return Err(JobsError::InvalidJob(format!(
                "encoded job of {} bytes exceeds the {} byte limit",
                body.len(),
                self.options.max_payload
            )));
        }
        Ok(body)
    }

    /// Send `body` so that it is not visible before `job`'s delay ends (or
    /// at least for the longest delay SQS allows).
    async fn send(&self, job: &Job, body: String) -> Result<(), JobsError> {
        let url = self.url().await?;
        let delay = send_delay(job.remaining_delay(self.clock.now()));
        self.transport
            .send(url, body, delay)
            .await
            .map_err(|e| self.err(e))
    }
}

/// SQS takes whole seconds; round up so waits and delays never shrink to 0.
fn ceil_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0)))
}

/// Whole seconds, rounded up and capped at `MAX_DELAY`.
fn send_delay(remaining: Option<Duration>) -> Duration {
    remaining.map_or(Duration::ZERO, |d| ceil_secs(d).min(MAX_DELAY))
}

pub struct SqsBroker<T> {
    shared: Arc<SqsShared<T>>,
}

impl<T: SqsTransport> SqsBroker<T> {
    pub fn new(pipeline: PipelineName, options: SqsOptions, transport: T) -> Self {
        Self::with_clock(pipeline, options, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pipeline: PipelineName,
        options: SqsOptions,
        transport: T,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| pipeline.as_str().to_string());
        Self {
            shared: Arc::new(SqsShared {
                pipeline,
                queue,
                options,
                transport,
                queue_url: OnceCell::new(),
                clock,
            }),
        }
    }
}

#[async_trait]
impl<T: SqsTransport> Broker for SqsBroker<T> {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    fn pipeline(&self) -> &PipelineName {
        &self.shared.pipeline
    }

    async fn check(&self) -> Result<(), JobsError> {
        let url = self.shared.url().await?;
        self.shared
            .transport
            .stat(url)
            .await
            .map(|_| ())
            .map_err(|e| self.shared.err(e))
    }

    async fn push(&self, job: Job) -> Result<JobId, JobsError> {
        let body = self.shared.encode(&job)?;
        self.shared.send(&job, body).await?;
        Ok(job.id())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
        let shared = &self.shared;
        let url = shared.url().await?;
        let wait = ceil_secs(wait.min(shared.options.wait_time)).min(MAX_WAIT);
        let visibility = shared.options.visibility_timeout.min(MAX_VISIBILITY);

        let Some(message) = shared
            .transport
            .receive(url, wait, visibility)
            .await
            .map_err(|e| shared.err(e))?
        else {
            return Ok(None);
        };

        let mut job = match Job::from_wire(message.body.as_bytes()) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(pipeline = %shared.pipeline, error = %err, "deleting undecodable message");
                shared
                    .transport
                    .delete(url, &message.receipt_handle)
                    .await
                    .map_err(|e| shared.err(e))?;
                return Ok(None);
            }
        };

        // Delay longer than SQS allows: put it back for the remainder.
        if job.remaining_delay(shared.clock.now()).is_some() {
            tracing::debug!(pipeline = %shared.pipeline, job_id = %job.id(), "deferring early message");
            shared.send(&job, message.body).await?;
            shared
                .transport
                .delete(url, &message.receipt_handle)
                .await
                .map_err(|e| shared.err(e))?;
            return Ok(None);
        }

        // Earlier receipts of this message that never resolved count as attempts;
        // in visibility mode they are the only record of failures.
        job.observe_attempts(
            job.attempts()
                .saturating_add(message.receive_count.saturating_sub(1)),
        );

        Ok(Some(Box::new(SqsDelivery {
            id: DeliveryId::generate(),
            receipt_handle: message.receipt_handle,
            job,
            shared: Arc::clone(shared),
        })))
    }

    async fn stat(&self) -> Result<BrokerStat, JobsError> {
        let url = self.shared.url().await?;
        self.shared
            .transport
            .stat(url)
            .await
            .map_err(|e| self.shared.err(e))
    }

    async fn stop(&self) -> Result<(), JobsError> {
        // HTTP client; nothing to release.
        Ok(())
    }
}

struct SqsDelivery<T> {
    id: DeliveryId,
    receipt_handle: String,
    job: Job,
    shared: Arc<SqsShared<T>>,
}

impl<T: SqsTransport> SqsDelivery<T> {
    fn map_err(&self, err: TransportError) -> JobsError {
        match err {
            TransportError::UnknownHandle => JobsError::HandleExpired {
                delivery: self.id,
                job_id: self.job.id(),
            },
            other => self.shared.err(other),
        }
    }

    async fn delete(&self) -> Result<(), JobsError> {
        let url = self.shared.url().await?;
        self.shared
            .transport
            .delete(url, &self.receipt_handle)
            .await
            .map_err(|e| self.map_err(e))
    }
}

#[async_trait]
impl<T: SqsTransport> Delivery for SqsDelivery<T> {
    fn id(&self) -> DeliveryId {
        self.id
    }

    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<(), JobsError> {
        self.delete().await
    }

    async fn nack(self: Box<Self>, delay: Duration) -> Result<(), JobsError> {
        match self.shared.options.nack_mode {
            NackMode::Republish => {
                let mut job = self.job.clone();
                job.record_failure(delay, self.shared.clock.now());
                let body = self.shared.encode(&job)?;
                self.shared.send(&job, body).await?;
                self.delete().await
            }
            NackMode::Visibility => {
                let url = self.shared.url().await?;
                self.shared
                    .transport
                    .change_visibility(url, &self.receipt_handle, ceil_secs(delay).min(MAX_VISIBILITY))
                    .await
                    .map_err(|e| self.map_err(e))
            }
        }
    }
}
