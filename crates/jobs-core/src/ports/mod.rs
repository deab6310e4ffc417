//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（メッセージブローカー、ワーカープール、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod broker;
pub mod clock;
pub mod executor;
pub mod failed;
pub mod id_generator;

// 主要な trait を再エクスポート
pub use self::broker::{Broker, BrokerFactory, Delivery, HandlerError, JobHandler, Reply};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{HandlerRegistry, WorkerExecutor};
pub use self::failed::{FailedJobHandler, LogFailedJobHandler};
pub use self::id_generator::{IdGenerator, UlidGenerator};
