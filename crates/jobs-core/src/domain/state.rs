//! Delivery state machine.

use serde::{Deserialize, Serialize};

/// State of one delivery of a job.
///
/// State transitions:
/// - Delivered -> Executing -> Acked
/// - Delivered -> Executing -> NackRequeued (job returns to Delivered after the delay)
/// - Delivered -> Executing -> NackDeadLettered
/// - Delivered -> NackDeadLettered (delivered with no attempts left)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Reserved by a consumer, not yet handed to the worker.
    Delivered,

    /// The worker is running the job.
    Executing,

    /// Removed from the pipeline after success.
    Acked,

    /// Returned to the pipeline with a delay.
    NackRequeued,

    /// Removed from the pipeline after exhausting its attempts
    /// (moved to the dead-letter pipeline or discarded).
    NackDeadLettered,
}

impl DeliveryState {
    /// Is this a terminal state for the delivery?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Acked | DeliveryState::NackRequeued | DeliveryState::NackDeadLettered
        )
    }

    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Delivered, Executing)
                | (Delivered, NackDeadLettered)
                | (Executing, Acked)
                | (Executing, NackRequeued)
                | (Executing, NackDeadLettered)
        )
    }
}
