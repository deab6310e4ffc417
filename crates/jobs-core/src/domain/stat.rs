//! Stat views: broker depth and consumer counters.

use serde::{Deserialize, Serialize};

use super::pipeline::PipelineName;

/// Best-effort depth snapshot reported by a broker.
///
/// Network backends answer from approximate server-side counters, so the
/// numbers may lag behind recent pushes and acks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStat {
    /// Ready for delivery now.
    pub active: u64,
    /// Waiting for their delay to elapse.
    pub delayed: u64,
    /// Reserved by a consumer and not yet resolved.
    pub reserved: u64,
}

impl BrokerStat {
    pub fn total(&self) -> u64 {
        self.active + self.delayed + self.reserved
    }
}

/// Counters kept by a pipeline's consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStat {
    pub delivered: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub handler_errors: u64,
    pub reconnects: u64,
    pub expired_handles: u64,
}

/// Everything `stat` reports for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStat {
    pub pipeline: PipelineName,
    pub driver: String,
    pub consuming: bool,
    pub workers: usize,

    /// `None` when the broker could not be queried.
    pub broker: Option<BrokerStat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_error: Option<String>,

    pub consumer: ConsumerStat,
}

impl PipelineStat {
    /// Jobs still owned by the broker (0 when unknown).
    pub fn depth(&self) -> u64 {
        self.broker.map(|b| b.total()).unwrap_or(0)
    }
}
