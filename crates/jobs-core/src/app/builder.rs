//! JobQueueServiceBuilder - サービスの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: pipeline 名の重複、存在しない dead-letter 先、
//!   broker の接続チェック（`optional` な pipeline は警告だけ）
//! - 開発体験の改善（どの pipeline が悪いかをエラーに含める）

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio_util::sync::CancellationToken;

use super::registry::{PipelineEntry, Registry};
use super::service::{JobQueueService, Settings, check_broker};
use crate::config::JobsConfig;
use crate::domain::{Decider, DefaultDecider, JobsError, PipelineName};
use crate::impls::DefaultBrokerFactory;
use crate::ports::{
    BrokerFactory, Clock, FailedJobHandler, LogFailedJobHandler, SystemClock, UlidGenerator,
    WorkerExecutor,
};

/// BuildError はサービス構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no worker executor was configured")]
    MissingExecutor,

    #[error("invalid jobs configuration: {0}")]
    Invalid(#[from] JobsError),

    #[error("pipeline `{pipeline}` failed its connection check: {source}")]
    Unavailable {
        pipeline: PipelineName,
        #[source]
        source: JobsError,
    },
}

/// # 使用例
/// ```ignore
/// let service = JobQueueService::builder(config)
///     .executor(my_executor)
///     .build()
///     .await?;
/// service.start().await?;
/// ```
pub struct JobQueueServiceBuilder {
    config: JobsConfig,
    executor: Option<Arc<dyn WorkerExecutor>>,
    factory: Option<Arc<dyn BrokerFactory>>,
    decider: Arc<dyn Decider>,
    failed: Arc<dyn FailedJobHandler>,
    clock: Arc<dyn Clock>,
}

impl JobQueueService {
    pub fn builder(config: JobsConfig) -> JobQueueServiceBuilder {
        JobQueueServiceBuilder::new(config)
    }
}

impl JobQueueServiceBuilder {
    pub fn new(config: JobsConfig) -> Self {
        Self {
            config,
            executor: None,
            factory: None,
            decider: Arc::new(DefaultDecider),
            failed: Arc::new(LogFailedJobHandler),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Defaults to [`DefaultBrokerFactory`] on the builder's clock, executor
    /// and failed-job hook.
    pub fn broker_factory(mut self, factory: Arc<dyn BrokerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn failed_job_handler(mut self, failed: Arc<dyn FailedJobHandler>) -> Self {
        self.failed = failed;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration, build one broker per pipeline and run
    /// its connection check. Consumers are not started; call
    /// [`JobQueueService::start`].
    pub async fn build(self) -> Result<JobQueueService, BuildError> {
        let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
        self.config.validate()?;

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(
                DefaultBrokerFactory::new(Arc::clone(&self.clock))
                    .with_executor(Arc::clone(&executor), Arc::clone(&self.failed)),
            )
        });

        let registry = Arc::new(Registry::new());
        for pipeline in &self.config.pipelines {
            let broker = factory.build(pipeline).await?;
            check_broker(pipeline, broker.as_ref())
                .await
                .map_err(|source| BuildError::Unavailable {
                    pipeline: pipeline.name.clone(),
                    source,
                })?;
            tracing::info!(
                pipeline = %pipeline.name,
                driver = broker.driver(),
                concurrency = pipeline.concurrency,
                "pipeline registered"
            );
            registry
                .insert(PipelineEntry::new(pipeline.clone(), broker))
                .await?;
        }

        Ok(JobQueueService {
            registry,
            factory,
            executor,
            decider: self.decider,
            failed: self.failed,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
            clock: self.clock,
            settings: Settings {
                grace_period: self.config.grace_period,
                poll_interval: self.config.poll_interval,
                push_retries: self.config.push_retries,
            },
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}
