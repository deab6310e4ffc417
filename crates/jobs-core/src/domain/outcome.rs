//! Outcome model: what the worker reported for one delivery.
//!
//! Worker failures are distinguished from transport errors: an `Outcome`
//! always describes the job, never the broker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// We serialize as SCREAMING_SNAKE_CASE: SUCCESS / FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Result of executing one delivery.
///
/// - `SUCCESS`: the job is done and gets acked.
/// - `FAILURE` + retryable: retried with backoff until attempts run out.
/// - `FAILURE` + not retryable: dead-lettered right away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default = "default_retryable")]
    pub retryable: bool,

    /// Worker-suggested delay; replaces the computed backoff (still capped).
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

fn default_retryable() -> bool {
    true
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            reason: None,
            retryable: true,
            retry_after: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            reason: Some(reason.into()),
            retryable: true,
            retry_after: None,
        }
    }

    /// A failure that retrying cannot fix (bad payload, rejected input...).
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failure(reason)
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("unspecified failure")
    }
}
