//! Sync broker: push runs the job inline and returns when it is done.
//!
//! 何もキューに積まないので reserve は常に空です。
//! 遅延付きのジョブは push の中で遅延分だけ待ってから実行します。
//! リトライはせず、失敗したジョブは FailedJobHandler に 1 回だけ通知されます。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::app::consumer::panic_message;
use crate::domain::{BrokerStat, Job, JobId, JobsError, Outcome, PipelineName};
use crate::ports::{Broker, Clock, Delivery, FailedJobHandler, SystemClock, WorkerExecutor};

pub const DRIVER: &str = "sync";

pub struct SyncBroker {
    pipeline: PipelineName,
    executor: Arc<dyn WorkerExecutor>,
    failed: Arc<dyn FailedJobHandler>,
    clock: Arc<dyn Clock>,
    waiting: AtomicU64,
    running: AtomicU64,
}

impl SyncBroker {
    pub fn new(
        pipeline: PipelineName,
        executor: Arc<dyn WorkerExecutor>,
        failed: Arc<dyn FailedJobHandler>,
    ) -> Self {
        Self {
            pipeline,
            executor,
            failed,
            clock: Arc::new(SystemClock),
            waiting: AtomicU64::new(0),
            running: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn run(&self, job: &Job) -> Outcome {
        self.running.fetch_add(1, Ordering::Relaxed);
        let outcome = match AssertUnwindSafe(self.executor.execute(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    pipeline = %self.pipeline,
                    job_id = %job.id(),
                    panic = %message,
                    "worker panicked"
                );
                Outcome::fatal(format!("worker panicked: {message}"))
            }
        };
        self.running.fetch_sub(1, Ordering::Relaxed);
        outcome
    }
}

#[async_trait]
impl Broker for SyncBroker {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    async fn check(&self) -> Result<(), JobsError> {
        Ok(())
    }

    async fn push(&self, job: Job) -> Result<JobId, JobsError> {
        if let Some(delay) = job.remaining_delay(self.clock.now()) {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }

        let outcome = self.run(&job).await;
        if outcome.is_success() {
            tracing::debug!(
                pipeline = %self.pipeline,
                job_id = %job.id(),
                name = job.name(),
                "job ran inline"
            );
        } else {
            self.failed.handle(&job, None, outcome.reason()).await;
        }
        Ok(job.id())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn stat(&self) -> Result<BrokerStat, JobsError> {
        Ok(BrokerStat {
            active: 0,
            delayed: self.waiting.load(Ordering::Relaxed),
            reserved: self.running.load(Ordering::Relaxed),
        })
    }

    async fn stop(&self) -> Result<(), JobsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Seen {
        jobs: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl WorkerExecutor for Seen {
        async fn execute(&self, job: &Job) -> Outcome {
            self.jobs.lock().unwrap().push((job.name().to_string(), Instant::now()));
            match job.name() {
                "boom" => panic!("handler exploded"),
                "bad" => Outcome::failure("rejected"),
                _ => Outcome::success(),
            }
        }
    }

    #[derive(Default)]
    struct Failures {
        reasons: Mutex<Vec<(JobId, Option<PipelineName>, String)>>,
    }

    #[async_trait]
    impl FailedJobHandler for Failures {
        async fn handle(&self, job: &Job, target: Option<&PipelineName>, reason: &str) {
            self.reasons
                .lock()
                .unwrap()
                .push((job.id(), target.cloned(), reason.to_string()));
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn job(name: &str) -> Job {
        Job::new(
            JobId::generate(),
            PipelineName::new("inline"),
            &b"{}"[..],
            RetryPolicy::default(),
            now(),
        )
        .with_name(name)
    }

    fn broker() -> (SyncBroker, Arc<Seen>, Arc<Failures>) {
        let seen = Arc::new(Seen::default());
        let failures = Arc::new(Failures::default());
        let broker = SyncBroker::new(PipelineName::new("inline"), seen.clone(), failures.clone())
            .with_clock(Arc::new(FixedClock::new(now())));
        (broker, seen, failures)
    }

    #[tokio::test]
    async fn push_runs_the_job_before_returning() {
        let (broker, seen, failures) = broker();
        let pushed = job("mail.welcome");
        let id = pushed.id();

        assert_eq!(broker.push(pushed).await.unwrap(), id);
        assert_eq!(seen.jobs.lock().unwrap().len(), 1);
        assert!(failures.reasons.lock().unwrap().is_empty());
        assert!(broker.reserve(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(broker.stat().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn failures_and_panics_go_to_the_failed_handler_once() {
        let (broker, seen, failures) = broker();
        let bad = job("bad");
        let bad_id = bad.id();

        assert_eq!(broker.push(bad).await.unwrap(), bad_id);
        broker.push(job("boom")).await.unwrap();

        assert_eq!(seen.jobs.lock().unwrap().len(), 2, "no retries");
        let reasons = failures.reasons.lock().unwrap();
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons[0], (bad_id, None, "rejected".to_string()));
        assert!(reasons[1].2.contains("handler exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_push_waits_before_running() {
        let (broker, seen, _) = broker();
        let started = Instant::now();
        let delayed =
            job("mail.welcome").with_delay_until(Some(now() + chrono::Duration::seconds(3)));

        broker.push(delayed).await.unwrap();
        let ran_at = seen.jobs.lock().unwrap()[0].1;
        assert_eq!(ran_at - started, Duration::from_secs(3));
    }
}
