//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **JobQueueServiceBuilder**: 設定検証と broker のワイヤリング
//! - **JobQueueService**: push / consume / stat / stop のファサード
//! - **Registry**: pipeline 名 → broker + consumer 状態
//! - **ConsumerGroup**: reserve→execute→decide→ack/nack のループ（スロットごとに 1 task）

pub mod builder;
pub(crate) mod consumer;
pub mod registry;
pub mod service;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, JobQueueServiceBuilder};
pub use self::registry::{PipelineEntry, Registry};
pub use self::service::JobQueueService;
pub use self::status::{ConsumerCounters, Counter};
