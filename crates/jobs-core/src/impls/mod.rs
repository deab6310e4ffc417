//! Impls - Broker の実装
//!
//! # 含まれる実装
//! - **ephemeral**: プロセス内のインメモリ pipeline（開発・テスト用）
//! - **amqp**: RabbitMQ 互換（`amqp` feature で lapin transport）
//! - **sqs**: Amazon SQS（`sqs` feature で aws-sdk-sqs transport）
//! - **beanstalk**: beanstalkd（TCP クライアント同梱）
//! - **sync**: push の中でその場で実行する（キューなし）
//! - **null**: 何も配送しない
//!
//! ネットワーク系の broker は transport trait の上に書かれていて、
//! ロジックはインメモリの fake transport でテストしています。

pub mod amqp;
pub mod beanstalk;
pub mod ephemeral;
pub mod null;
pub mod sqs;
pub mod sync;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DriverConfig, PipelineConfig};
use crate::domain::JobsError;
use crate::ports::{
    Broker, BrokerFactory, Clock, FailedJobHandler, LogFailedJobHandler, SystemClock,
    WorkerExecutor,
};

pub use self::amqp::AmqpBroker;
pub use self::beanstalk::BeanstalkBroker;
pub use self::ephemeral::EphemeralBroker;
pub use self::null::NullBroker;
pub use self::sqs::SqsBroker;
pub use self::sync::SyncBroker;
pub use self::transport::TransportError;

/// Builds the broker named by each pipeline's `driver`.
pub struct DefaultBrokerFactory {
    clock: Arc<dyn Clock>,
    /// Only the `sync` driver uses these.
    executor: Option<Arc<dyn WorkerExecutor>>,
    failed: Arc<dyn FailedJobHandler>,
}

impl DefaultBrokerFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            executor: None,
            failed: Arc::new(LogFailedJobHandler),
        }
    }

    /// Executor and failed-job hook for `sync` pipelines.
    pub fn with_executor(
        mut self,
        executor: Arc<dyn WorkerExecutor>,
        failed: Arc<dyn FailedJobHandler>,
    ) -> Self {
        self.executor = Some(executor);
        self.failed = failed;
        self
    }
}

impl Default for DefaultBrokerFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl BrokerFactory for DefaultBrokerFactory {
    async fn build(&self, config: &PipelineConfig) -> Result<Arc<dyn Broker>, JobsError> {
        let pipeline = config.name.clone();
        let clock = Arc::clone(&self.clock);

        let broker: Arc<dyn Broker> = match &config.driver {
            DriverConfig::Ephemeral(options) => {
                Arc::new(EphemeralBroker::new(pipeline, options.clone()).with_clock(clock))
            }
            DriverConfig::Null => Arc::new(NullBroker::new(pipeline)),
            DriverConfig::Sync => {
                let executor = self.executor.clone().ok_or_else(|| {
                    JobsError::Config(format!(
                        "pipeline `{}` uses the sync driver, but the broker factory has no executor",
                        config.name
                    ))
                })?;
                Arc::new(
                    SyncBroker::new(pipeline, executor, Arc::clone(&self.failed)).with_clock(clock),
                )
            }
            DriverConfig::Beanstalk(options) => {
                let connector = beanstalk::client::TcpConnector::new(
                    options.addr.clone(),
                    options.connect_timeout,
                )
                .with_max_body(options.max_job_size);
                Arc::new(BeanstalkBroker::with_clock(
                    pipeline,
                    options.clone(),
                    connector,
                    clock,
                )?)
            }
            DriverConfig::Amqp(options) => amqp_broker(config, options, clock)?,
            DriverConfig::Sqs(options) => sqs_broker(config, options, clock).await?,
        };
        tracing::debug!(pipeline = %config.name, driver = broker.driver(), "broker built");
        Ok(broker)
    }
}

#[cfg(feature = "amqp")]
fn amqp_broker(
    config: &PipelineConfig,
    options: &amqp::AmqpOptions,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Broker>, JobsError> {
    let consumer_tag = format!("jobs.{}.{}", config.name, std::process::id());
    let transport = amqp::LapinTransport::new(options.dsn.clone(), consumer_tag);
    Ok(Arc::new(AmqpBroker::with_clock(
        config.name.clone(),
        options.clone(),
        config.concurrency,
        transport,
        clock,
    )))
}

#[cfg(not(feature = "amqp"))]
fn amqp_broker(
    config: &PipelineConfig,
    _options: &amqp::AmqpOptions,
    _clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Broker>, JobsError> {
    Err(JobsError::Config(format!(
        "pipeline `{}` uses the amqp driver, which needs the `amqp` feature",
        config.name
    )))
}

#[cfg(feature = "sqs")]
async fn sqs_broker(
    config: &PipelineConfig,
    options: &sqs::SqsOptions,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Broker>, JobsError> {
    let transport =
        sqs::AwsSqsTransport::from_env(options.region.clone(), options.endpoint.clone()).await;
    Ok(Arc::new(SqsBroker::with_clock(
        config.name.clone(),
        options.clone(),
        transport,
        clock,
    )))
}

#[cfg(not(feature = "sqs"))]
async fn sqs_broker(
    config: &PipelineConfig,
    _options: &sqs::SqsOptions,
    _clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Broker>, JobsError> {
    Err(JobsError::Config(format!(
        "pipeline `{}` uses the sqs driver, which needs the `sqs` feature",
        config.name
    )))
}
