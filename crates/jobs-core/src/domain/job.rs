//! Job record: payload + delivery metadata.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::JobsError;
use super::ids::JobId;
use super::pipeline::PipelineName;
use super::retry::RetryPolicy;

/// A job as stored by a broker.
///
/// Design:
/// - The payload is opaque; only the worker interprets it.
/// - Immutable once pushed, except `attempts` and `delay_until`, which
///   brokers update on retry.
/// - The same JSON form (`to_wire` / `from_wire`) travels through AMQP, SQS
///   and Beanstalk so every backend sees identical metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    pipeline: PipelineName,

    /// Handler name used to route the job to a worker; empty means the default handler.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,

    #[serde(with = "payload_base64")]
    payload: Bytes,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,

    created_at: DateTime<Utc>,

    /// Failed attempts so far (the current delivery is attempt `attempts + 1`).
    #[serde(default)]
    attempts: u32,

    retry: RetryPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_until: Option<DateTime<Utc>>,

    /// Set on the copy pushed to a dead-letter pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dead_lettered: Option<DeadLetterInfo>,
}

/// Where a dead-lettered job came from and why it left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    pub origin: PipelineName,
    pub reason: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        pipeline: PipelineName,
        payload: impl Into<Bytes>,
        retry: RetryPolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pipeline,
            name: String::new(),
            payload: payload.into(),
            headers: BTreeMap::new(),
            created_at,
            attempts: 0,
            retry,
            delay_until: None,
            dead_lettered: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_delay_until(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.delay_until = at;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dead_letter(&self) -> Option<&PipelineName> {
        self.retry.dead_letter.as_ref()
    }

    pub fn delay_until(&self) -> Option<DateTime<Utc>> {
        self.delay_until
    }

    pub fn dead_lettered(&self) -> Option<&DeadLetterInfo> {
        self.dead_lettered.as_ref()
    }

    /// No deliveries left on this pipeline.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.retry.max_attempts
    }

    /// Time left until the job becomes eligible, if any.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.delay_until
            .and_then(|at| (at - now).to_std().ok())
            .filter(|d| !d.is_zero())
    }

    /// One more failed attempt; the job becomes eligible again after `delay`.
    pub(crate) fn record_failure(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_until = if delay.is_zero() {
            None
        } else {
            Some(deadline_after(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
        };
    }

    /// Raise the attempt count to what the backend observed (e.g. receive or
    /// reserve counters). Never lowers it.
    pub(crate) fn observe_attempts(&mut self, attempts: u32) {
        self.attempts = self.attempts.max(attempts);
    }

    /// Copy of this job addressed to `target`, keeping id, payload, headers
    /// and creation time. The copy starts a fresh retry budget under the
    /// target's policy; `failed_attempts` (executions that failed on this
    /// pipeline) is kept in `DeadLetterInfo`.
    pub fn to_dead_letter(
        &self,
        target: PipelineName,
        target_retry: RetryPolicy,
        reason: impl Into<String>,
        failed_attempts: u32,
        now: DateTime<Utc>,
    ) -> Job {
        Job {
            id: self.id,
            pipeline: target,
            name: self.name.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            created_at: self.created_at,
            attempts: 0,
            retry: target_retry,
            delay_until: None,
            dead_lettered: Some(DeadLetterInfo {
                origin: self.pipeline.clone(),
                reason: reason.into(),
                attempts: failed_attempts,
                at: now,
            }),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, JobsError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, JobsError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `now + delay`, or `None` when the sum leaves chrono's range.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
