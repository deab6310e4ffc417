//! JobQueueService - broker に依存しない jobs のファサード
//!
//! - push: pipeline を引いて broker に渡す（一時的な失敗はバックオフしてリトライ）
//! - consume / stop_consume: consumer group の開始・一時停止（どちらも冪等）
//! - declare: 実行中に pipeline を追加
//! - stat: broker の深さ + consumer のカウンタ
//! - stop: 全 consumer group を grace period 内に止め、最後に broker を止める

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::consumer::{Consumer, ConsumerGroup};
use super::registry::{PipelineEntry, Registry, push_with_retries};
use crate::config::PipelineConfig;
use crate::domain::job::deadline_after;
use crate::domain::{Decider, Job, JobId, JobsError, PipelineName, PipelineStat, PushOptions};
use crate::ports::{Broker, BrokerFactory, Clock, FailedJobHandler, IdGenerator, WorkerExecutor};

/// Service-wide timings and limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub push_retries: u32,
}

pub struct JobQueueService {
    pub(crate) registry: Arc<Registry>,
    pub(crate) factory: Arc<dyn BrokerFactory>,
    pub(crate) executor: Arc<dyn WorkerExecutor>,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) failed: Arc<dyn FailedJobHandler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) settings: Settings,
    pub(crate) shutdown: CancellationToken,
    pub(crate) started: AtomicBool,
}

impl JobQueueService {
    /// Start consumers for every pipeline configured with `consume = true`.
    pub async fn start(&self) -> Result<(), JobsError> {
        self.started.store(true, Ordering::Release);
        for entry in self.registry.entries().await {
            if entry.config.consume {
                self.start_group(&entry).await?;
            }
        }
        Ok(())
    }

    pub async fn push(
        &self,
        pipeline: &PipelineName,
        payload: impl Into<Bytes>,
        options: PushOptions,
    ) -> Result<JobId, JobsError> {
        let entry = self.registry.get(pipeline).await?;

        let retry = options.retry_policy(&entry.config.retry);
        retry.validate()?;
        if let Some(target) = &retry.dead_letter {
            if target == pipeline {
                return Err(JobsError::InvalidJob(format!(
                    "pipeline `{pipeline}` cannot dead-letter into itself"
                )));
            }
            if !self.registry.contains(target).await {
                return Err(JobsError::InvalidJob(format!(
                    "unknown dead-letter pipeline `{target}`"
                )));
            }
        }

        let now = self.clock.now();
        let delay_until = match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => Some(
                deadline_after(now, delay)
                    .ok_or_else(|| JobsError::InvalidJob(format!("delay {delay:?} is too large")))?,
            ),
            None => None,
        };
        let mut job = Job::new(self.ids.generate_job_id(), pipeline.clone(), payload, retry, now)
            .with_headers(options.headers)
            .with_delay_until(delay_until);
        if let Some(name) = options.name {
            job = job.with_name(name);
        }

        let id = push_with_retries(entry.broker.as_ref(), job, self.settings.push_retries).await?;
        tracing::debug!(%pipeline, job_id = %id, delay = ?options.delay, "job pushed");
        Ok(id)
    }

    /// Start consuming `pipeline`. No-op when already consuming.
    pub async fn consume(&self, pipeline: &PipelineName) -> Result<(), JobsError> {
        let entry = self.registry.get(pipeline).await?;
        self.start_group(&entry).await
    }

    /// Pause `pipeline`: in-flight jobs get the grace period to finish.
    /// No-op when not consuming.
    pub async fn stop_consume(&self, pipeline: &PipelineName) -> Result<(), JobsError> {
        let entry = self.registry.get(pipeline).await?;
        self.stop_group(&entry).await;
        Ok(())
    }

    /// Add a pipeline at runtime. Consumers start right away when the
    /// service is running and the pipeline has `consume = true`.
    pub async fn declare(&self, config: PipelineConfig) -> Result<(), JobsError> {
        config.validate()?;
        if self.registry.contains(&config.name).await {
            return Err(JobsError::DuplicatePipeline(config.name));
        }
        if let Some(target) = &config.retry.dead_letter
            && !self.registry.contains(target).await
        {
            return Err(JobsError::Config(format!(
                "pipeline `{}` dead-letters into unknown pipeline `{target}`",
                config.name
            )));
        }

        let broker = self.factory.build(&config).await?;
        check_broker(&config, broker.as_ref()).await?;
        let entry = self.registry.insert(PipelineEntry::new(config, broker)).await?;
        tracing::info!(pipeline = %entry.name(), driver = entry.broker.driver(), "pipeline declared");

        if entry.config.consume && self.started.load(Ordering::Acquire) {
            self.start_group(&entry).await?;
        }
        Ok(())
    }

    pub async fn pipelines(&self) -> Vec<PipelineName> {
        self.registry.names().await
    }

    pub async fn stat_pipeline(&self, pipeline: &PipelineName) -> Result<PipelineStat, JobsError> {
        let entry = self.registry.get(pipeline).await?;
        Ok(pipeline_stat(&entry).await)
    }

    /// Stats for every pipeline, sorted by name.
    pub async fn stat(&self) -> Vec<PipelineStat> {
        let entries = self.registry.entries().await;
        join_all(entries.iter().map(|entry| pipeline_stat(entry))).await
    }

    /// Stop every consumer group (concurrently, each within the grace
    /// period), then release broker connections.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let entries = self.registry.entries().await;
        join_all(entries.iter().map(|entry| self.stop_group(entry))).await;

        for entry in &entries {
            if let Err(err) = entry.broker.stop().await {
                tracing::warn!(pipeline = %entry.name(), error = %err, "broker stop failed");
            }
        }
        tracing::info!(pipelines = entries.len(), "jobs service stopped");
    }

    async fn start_group(&self, entry: &Arc<PipelineEntry>) -> Result<(), JobsError> {
        let mut group = entry.group.lock().await;
        if group.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(JobsError::unavailable(entry.name(), "jobs service is stopped"));
        }

        let consumer = Arc::new(Consumer {
            pipeline: entry.name().clone(),
            broker: Arc::clone(&entry.broker),
            executor: Arc::clone(&self.executor),
            decider: Arc::clone(&self.decider),
            failed: Arc::clone(&self.failed),
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&entry.counters),
            clock: Arc::clone(&self.clock),
            poll_interval: self.settings.poll_interval,
            push_retries: self.settings.push_retries,
        });
        let workers = entry.config.concurrency;
        *group = Some(ConsumerGroup::spawn(consumer, workers, self.shutdown.child_token()));
        entry.set_consuming(true);
        tracing::info!(pipeline = %entry.name(), workers, "consuming");
        Ok(())
    }

    async fn stop_group(&self, entry: &Arc<PipelineEntry>) {
        let mut group = entry.group.lock().await;
        let Some(running) = group.take() else {
            return;
        };
        entry.set_consuming(false);
        running.stop(self.settings.grace_period).await;
        if let Err(err) = entry.broker.pause().await {
            tracing::warn!(pipeline = %entry.name(), error = %err, "broker pause failed");
        }
        tracing::info!(pipeline = %entry.name(), "consuming paused");
    }
}

/// Startup connection check; an optional pipeline only logs the failure.
pub(crate) async fn check_broker(config: &PipelineConfig, broker: &dyn Broker) -> Result<(), JobsError> {
    match broker.check().await {
        Ok(()) => Ok(()),
        Err(err) if config.optional => {
            tracing::warn!(
                pipeline = %config.name,
                driver = broker.driver(),
                error = %err,
                "broker check failed, registering optional pipeline anyway"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn pipeline_stat(entry: &PipelineEntry) -> PipelineStat {
    let consuming = entry.is_consuming();
    let (broker, broker_error) = match entry.broker.stat().await {
        Ok(stat) => (Some(stat), None),
        Err(err) => {
            tracing::debug!(pipeline = %entry.name(), error = %err, "broker stat failed");
            (None, Some(err.to_string()))
        }
    };
    PipelineStat {
        pipeline: entry.name().clone(),
        driver: entry.broker.driver().to_string(),
        consuming,
        workers: if consuming { entry.config.concurrency } else { 0 },
        broker,
        broker_error,
        consumer: entry.counters.snapshot(),
    }
}
