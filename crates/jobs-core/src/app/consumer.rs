//! Consumer - pipeline ごとの consumer group
//!
//! # フロー（1 スロット）
//! 1. `Broker::reserve` で delivery を 1 件取る（poll_interval まで待つ）
//! 2. `WorkerExecutor::execute` → Outcome（panic は捕まえてリトライ可能な失敗にする）
//! 3. `Decider` → Decision
//! 4. ack / nack(delay) / dead-letter push + ack
//!
//! スロットは tokio task 1 本ずつで、各スロットが持つ delivery は高々 1 件。
//! キャンセルは次の reserve の境目で効きます。実行中のジョブは grace period まで待ち、
//! それを過ぎたら task を abort して delivery を未解決のまま手放します
//! （broker のタイムアウトで再配送される）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::registry::{Registry, push_with_retries};
use super::status::{ConsumerCounters, Counter};
use crate::domain::{Decider, Decision, Job, JobId, JobsError, Outcome, PipelineName};
use crate::ports::broker::reconnect_delay;
use crate::ports::{Broker, Clock, Delivery, FailedJobHandler, WorkerExecutor};

/// Everything one pipeline's consumer slots share.
pub(crate) struct Consumer {
    pub pipeline: PipelineName,
    pub broker: Arc<dyn Broker>,
    pub executor: Arc<dyn WorkerExecutor>,
    pub decider: Arc<dyn Decider>,
    pub failed: Arc<dyn FailedJobHandler>,
    /// Dead-letter targets are looked up here.
    pub registry: Arc<Registry>,
    pub counters: Arc<ConsumerCounters>,
    pub clock: Arc<dyn Clock>,
    pub poll_interval: Duration,
    pub push_retries: u32,
}

impl Consumer {
    async fn run(&self, slot: usize, cancel: CancellationToken) {
        tracing::debug!(pipeline = %self.pipeline, slot, "consumer slot started");
        let mut failures: u32 = 0;

        loop {
            let reserved = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                reserved = self.broker.reserve(self.poll_interval) => reserved,
            };

            match reserved {
                Ok(Some(delivery)) => {
                    failures = 0;
                    self.process(delivery).await;
                }
                Ok(None) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    self.counters.incr(Counter::Reconnect);
                    let pause = reconnect_delay(failures);
                    if err.is_retryable() {
                        tracing::warn!(pipeline = %self.pipeline, slot, error = %err, retry_in = ?pause, "reserve failed");
                    } else {
                        tracing::error!(pipeline = %self.pipeline, slot, error = %err, retry_in = ?pause, "reserve failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        tracing::debug!(pipeline = %self.pipeline, slot, "consumer slot stopped");
    }

    async fn process(&self, delivery: Box<dyn Delivery>) {
        self.counters.incr(Counter::Delivered);
        let job = delivery.job().clone();
        tracing::debug!(
            pipeline = %self.pipeline,
            job_id = %job.id(),
            delivery = %delivery.id(),
            attempts = job.attempts(),
            "job delivered"
        );

        // executions that failed on this pipeline once this delivery is done
        let (decision, failed_attempts) = if job.is_exhausted() {
            (self.decider.exhausted(&job), job.attempts())
        } else {
            let outcome = self.execute(&job).await;
            if !outcome.is_success() {
                self.counters.incr(Counter::HandlerError);
            }
            (self.decider.decide(&job, &outcome), job.attempts() + 1)
        };

        match decision {
            Decision::Ack => {
                self.resolve(&job, delivery.ack().await, Counter::Acked);
            }
            Decision::Retry { delay, reason } => {
                tracing::info!(
                    pipeline = %self.pipeline,
                    job_id = %job.id(),
                    attempts = job.attempts() + 1,
                    retry_in = ?delay,
                    reason = %reason,
                    "job failed, retrying"
                );
                self.resolve(&job, delivery.nack(delay).await, Counter::Retried);
            }
            Decision::DeadLetter { target, reason } => {
                self.dead_letter(delivery, &job, target, reason, failed_attempts).await;
            }
        }
    }

    async fn execute(&self, job: &Job) -> Outcome {
        match AssertUnwindSafe(self.executor.execute(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(pipeline = %self.pipeline, job_id = %job.id(), panic = %message, "worker panicked");
                Outcome::failure(format!("worker panicked: {message}"))
            }
        }
    }

    /// Count a resolved delivery; returns whether it went through.
    fn resolve(&self, job: &Job, result: Result<(), JobsError>, counter: Counter) -> bool {
        match result {
            Ok(()) => {
                self.counters.incr(counter);
                true
            }
            Err(JobsError::HandleExpired { delivery, .. }) => {
                self.counters.incr(Counter::ExpiredHandle);
                tracing::warn!(pipeline = %self.pipeline, job_id = %job.id(), %delivery, "delivery handle expired");
                false
            }
            Err(err) => {
                tracing::warn!(pipeline = %self.pipeline, job_id = %job.id(), error = %err, "resolving delivery failed");
                false
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: Box<dyn Delivery>,
        job: &Job,
        target: Option<PipelineName>,
        reason: String,
        failed_attempts: u32,
    ) {
        let Some(target) = target else {
            if self.resolve(job, delivery.ack().await, Counter::Discarded) {
                self.failed.handle(job, None, &reason).await;
            }
            return;
        };

        match self.push_dead_letter(job, &target, &reason, failed_attempts).await {
            Ok(_) => {
                if self.resolve(job, delivery.ack().await, Counter::DeadLettered) {
                    self.failed.handle(job, Some(&target), &reason).await;
                }
            }
            Err(err) => {
                // keep the job rather than lose it
                let delay = job.retry().next_delay(job.attempts());
                tracing::error!(
                    pipeline = %self.pipeline,
                    job_id = %job.id(),
                    dead_letter = %target,
                    error = %err,
                    retry_in = ?delay,
                    "dead-letter push failed, returning job to its pipeline"
                );
                self.resolve(job, delivery.nack(delay).await, Counter::Retried);
            }
        }
    }

    async fn push_dead_letter(
        &self,
        job: &Job,
        target: &PipelineName,
        reason: &str,
        failed_attempts: u32,
    ) -> Result<JobId, JobsError> {
        let entry = self.registry.get(target).await?;
        let copy = job.to_dead_letter(
            target.clone(),
            entry.config.retry.clone(),
            reason,
            failed_attempts,
            self.clock.now(),
        );
        push_with_retries(entry.broker.as_ref(), copy, self.push_retries).await
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Running slots of one pipeline.
pub(crate) struct ConsumerGroup {
    pipeline: PipelineName,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl ConsumerGroup {
    pub fn spawn(consumer: Arc<Consumer>, slots: usize, cancel: CancellationToken) -> Self {
        let mut tasks = JoinSet::new();
        for slot in 0..slots {
            let consumer = Arc::clone(&consumer);
            let cancel = cancel.clone();
            tasks.spawn(async move { consumer.run(slot, cancel).await });
        }
        Self {
            pipeline: consumer.pipeline.clone(),
            cancel,
            tasks,
        }
    }

    /// Cancel, wait up to `grace` for in-flight jobs, then abort the rest.
    pub async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();

        let drained = tokio::time::timeout(grace, drain(&self.pipeline, &mut self.tasks)).await;
        if drained.is_err() {
            tracing::warn!(
                pipeline = %self.pipeline,
                abandoned = self.tasks.len(),
                "grace period elapsed, abandoning in-flight jobs"
            );
            self.tasks.abort_all();
            drain(&self.pipeline, &mut self.tasks).await;
        }
    }
}

async fn drain(pipeline: &PipelineName, tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined
            && err.is_panic()
        {
            tracing::error!(%pipeline, error = %err, "consumer slot panicked");
        }
    }
}
