//! Service table: a fixed, ordered list of services served in order and
//! stopped in reverse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobs_core::JobQueueService;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn serve(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Container {
    services: Vec<Arc<dyn Service>>,
    /// How many services are currently serving, from the front.
    running: Mutex<usize>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Serve every service in order. If one fails, the ones already started
    /// are stopped again before the error is returned.
    pub async fn serve(&self) -> anyhow::Result<()> {
        for service in &self.services {
            tracing::info!(service = service.name(), "starting service");
            if let Err(err) = service.serve().await {
                tracing::error!(service = service.name(), error = %err, "service failed to start");
                self.stop().await;
                return Err(err.context(format!("starting service `{}`", service.name())));
            }
            *self.running.lock().await += 1;
        }
        Ok(())
    }

    /// Stop the running services in reverse order. Errors are logged, not returned.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        for service in self.services[..*running].iter().rev() {
            tracing::info!(service = service.name(), "stopping service");
            if let Err(err) = service.stop().await {
                tracing::warn!(service = service.name(), error = %err, "service stop failed");
            }
        }
        *running = 0;
    }
}

/// The job queue: start consumers on serve, drain and stop on stop.
pub struct JobsService {
    jobs: Arc<JobQueueService>,
}

impl JobsService {
    pub fn new(jobs: Arc<JobQueueService>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Service for JobsService {
    fn name(&self) -> &'static str {
        "jobs"
    }

    async fn serve(&self) -> anyhow::Result<()> {
        self.jobs.start().await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.jobs.stop().await;
        Ok(())
    }
}

/// Logs per-pipeline stats on an interval.
pub struct StatsReporter {
    jobs: Arc<JobQueueService>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatsReporter {
    pub fn new(jobs: Arc<JobQueueService>, interval: Duration) -> Self {
        Self {
            jobs,
            interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for StatsReporter {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn serve(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let jobs = Arc::clone(&self.jobs);
        let cancel = self.cancel.clone();
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                for stat in jobs.stat().await {
                    tracing::info!(
                        pipeline = %stat.pipeline,
                        driver = %stat.driver,
                        consuming = stat.consuming,
                        workers = stat.workers,
                        depth = stat.depth(),
                        delivered = stat.consumer.delivered,
                        acked = stat.consumer.acked,
                        retried = stat.consumer.retried,
                        dead_lettered = stat.consumer.dead_lettered,
                        discarded = stat.consumer.discarded,
                        broker_error = stat.broker_error.as_deref().unwrap_or(""),
                        "pipeline stats"
                    );
                }
            }
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            task.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recording {
        name: &'static str,
        fail: bool,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Service for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn serve(&self) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("refused");
            }
            self.log.lock().unwrap().push(format!("serve {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn container(log: &Arc<StdMutex<Vec<String>>>, names: &[(&'static str, bool)]) -> Container {
        names.iter().fold(Container::new(), |c, (name, fail)| {
            c.with(Arc::new(Recording {
                name,
                fail: *fail,
                log: Arc::clone(log),
            }))
        })
    }

    #[tokio::test]
    async fn serves_in_order_and_stops_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let c = container(&log, &[("a", false), ("b", false), ("c", false)]);
        c.serve().await.unwrap();
        c.stop().await;
        c.stop().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["serve a", "serve b", "serve c", "stop c", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn failed_start_unwinds_started_services() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let c = container(&log, &[("a", false), ("b", true), ("c", false)]);
        let err = c.serve().await.unwrap_err();
        assert!(format!("{err:#}").contains("starting service `b`"));
        assert_eq!(*log.lock().unwrap(), vec!["serve a", "stop a"]);
    }
}
