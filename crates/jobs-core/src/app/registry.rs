//! Registry - pipeline 名 → broker / consumer 状態
//!
//! # ロック方針
//! - マップ自体は `RwLock`。push / stat はエントリの `Arc` を clone したら
//!   すぐにロックを離し、broker I/O 中はロックを持たない
//! - consumer group の開始・停止はエントリごとの `Mutex` で直列化する

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};

use super::consumer::ConsumerGroup;
use super::status::ConsumerCounters;
use crate::config::PipelineConfig;
use crate::domain::{Job, JobId, JobsError, PipelineName};
use crate::ports::Broker;
use crate::ports::broker::reconnect_delay;

/// One registered pipeline.
pub struct PipelineEntry {
    pub config: PipelineConfig,
    pub broker: Arc<dyn Broker>,
    pub counters: Arc<ConsumerCounters>,
    pub(crate) group: Mutex<Option<ConsumerGroup>>,
    consuming: AtomicBool,
}

impl PipelineEntry {
    pub fn new(config: PipelineConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            counters: Arc::new(ConsumerCounters::default()),
            group: Mutex::new(None),
            consuming: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &PipelineName {
        &self.config.name
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Acquire)
    }

    pub(crate) fn set_consuming(&self, consuming: bool) {
        self.consuming.store(consuming, Ordering::Release);
    }
}

#[derive(Default)]
pub struct Registry {
    pipelines: RwLock<HashMap<PipelineName, Arc<PipelineEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &PipelineName) -> Result<Arc<PipelineEntry>, JobsError> {
        self.pipelines
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| JobsError::UnknownPipeline(name.clone()))
    }

    pub async fn contains(&self, name: &PipelineName) -> bool {
        self.pipelines.read().await.contains_key(name)
    }

    pub async fn insert(&self, entry: PipelineEntry) -> Result<Arc<PipelineEntry>, JobsError> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.contains_key(entry.name()) {
            return Err(JobsError::DuplicatePipeline(entry.name().clone()));
        }
        let entry = Arc::new(entry);
        pipelines.insert(entry.name().clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// All entries, sorted by name.
    pub async fn entries(&self) -> Vec<Arc<PipelineEntry>> {
        let mut entries: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    pub async fn names(&self) -> Vec<PipelineName> {
        let mut names: Vec<_> = self.pipelines.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Push, retrying transient broker errors up to `retries` extra times.
pub async fn push_with_retries(
    broker: &dyn Broker,
    job: Job,
    retries: u32,
) -> Result<JobId, JobsError> {
    let mut failures: u32 = 0;
    loop {
        match broker.push(job.clone()).await {
            Ok(id) => return Ok(id),
            Err(err) if err.is_retryable() && failures < retries => {
                failures += 1;
                let pause = reconnect_delay(failures);
                tracing::warn!(
                    pipeline = %broker.pipeline(),
                    job_id = %job.id(),
                    error = %err,
                    retry_in = ?pause,
                    "push failed, retrying"
                );
                tokio::time::sleep(pause).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::domain::{BrokerStat, RetryPolicy};
    use crate::impls::NullBroker;
    use crate::ports::Delivery;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn entry(name: &str) -> PipelineEntry {
        PipelineEntry::new(
            PipelineConfig::new(name, DriverConfig::Null),
            Arc::new(NullBroker::new(PipelineName::new(name))),
        )
    }

    fn job() -> Job {
        Job::new(
            JobId::generate(),
            PipelineName::new("flaky"),
            &b"x"[..],
            RetryPolicy::default(),
            chrono::Utc::now(),
        )
    }

    /// Fails the first `failures` pushes with a transport error.
    struct FlakyBroker {
        pipeline: PipelineName,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        fn driver(&self) -> &'static str {
            "flaky"
        }
        fn pipeline(&self) -> &PipelineName {
            &self.pipeline
        }
        async fn check(&self) -> Result<(), JobsError> {
            Ok(())
        }
        async fn push(&self, job: Job) -> Result<JobId, JobsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(JobsError::unavailable(&self.pipeline, "connection reset"))
            } else {
                Ok(job.id())
            }
        }
        async fn reserve(&self, _wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
            Ok(None)
        }
        async fn stat(&self) -> Result<BrokerStat, JobsError> {
            Ok(BrokerStat::default())
        }
        async fn stop(&self) -> Result<(), JobsError> {
            Ok(())
        }
    }

    fn flaky(failures: u32) -> FlakyBroker {
        FlakyBroker {
            pipeline: PipelineName::new("flaky"),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn rejects_duplicates_and_lists_sorted() {
        let registry = Registry::new();
        registry.insert(entry("reports")).await.unwrap();
        registry.insert(entry("emails")).await.unwrap();
        assert!(matches!(
            registry.insert(entry("emails")).await,
            Err(JobsError::DuplicatePipeline(_))
        ));
        assert_eq!(
            registry.names().await,
            vec![PipelineName::new("emails"), PipelineName::new("reports")]
        );
    }

    #[tokio::test]
    async fn unknown_pipeline() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get(&PipelineName::new("missing")).await,
            Err(JobsError::UnknownPipeline(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn push_retries_transient_errors() {
        let broker = flaky(2);
        let job = job();
        let id = push_with_retries(&broker, job.clone(), 3).await.unwrap();
        assert_eq!(id, job.id());
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn push_gives_up_after_retries() {
        let broker = flaky(10);
        let err = push_with_retries(&broker, job(), 2).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
    }
}
