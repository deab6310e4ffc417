//! jobs-core
//!
//! Job queue core: named pipelines bound to interchangeable brokers, one
//! push / consume / acknowledge contract on top, and the retry / dead-letter
//! state machine run by the consumer loops.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, retry, outcome, decision, state, stat, errors）
//! - **ports**: 抽象化レイヤー（Broker, WorkerExecutor, FailedJobHandler, Clock, IdGenerator）
//! - **impls**: Broker の実装（ephemeral, amqp, sqs, beanstalk, sync, null）
//! - **app**: アプリケーションロジック（builder, service, registry, consumer）
//! - **config**: serde で読める設定型

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{BuildError, JobQueueService, JobQueueServiceBuilder};
pub use config::{DriverConfig, JobsConfig, PipelineConfig};
pub use domain::{Job, JobId, JobsError, Outcome, PipelineName, PipelineStat, PushOptions, RetryPolicy};
pub use ports::{HandlerRegistry, WorkerExecutor};
