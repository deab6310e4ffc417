//! Per-push options.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::pipeline::PipelineName;
use super::retry::RetryPolicy;

/// Options supplied by a producer with each push.
///
/// Unset fields fall back to the pipeline's retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushOptions {
    /// Handler name (see [`Job::name`](super::Job::name)).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<PipelineName>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl PushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.base_delay = Some(base_delay);
        self.multiplier = Some(multiplier);
        self
    }

    pub fn with_dead_letter(mut self, pipeline: impl Into<PipelineName>) -> Self {
        self.dead_letter = Some(pipeline.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Overlay these options on a pipeline's default policy.
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_delay: defaults.max_delay,
            dead_letter: self
                .dead_letter
                .clone()
                .or_else(|| defaults.dead_letter.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_keep_pipeline_defaults() {
        let defaults = RetryPolicy {
            dead_letter: Some(PipelineName::new("failed")),
            ..RetryPolicy::default()
        };
        assert_eq!(PushOptions::new().retry_policy(&defaults), defaults);
    }

    #[test]
    fn options_override_individual_fields() {
        let defaults = RetryPolicy::default();
        let policy = PushOptions::new()
            .with_max_attempts(7)
            .with_backoff(Duration::from_millis(250), 3.0)
            .with_dead_letter("parking")
            .retry_policy(&defaults);

        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max_delay, defaults.max_delay);
        assert_eq!(policy.dead_letter, Some(PipelineName::new("parking")));
    }

    #[test]
    fn deserializes_from_json() {
        let options: PushOptions = serde_json::from_value(serde_json::json!({
            "delay": "2s",
            "max_attempts": 5,
            "headers": {"tenant": "acme"}
        }))
        .unwrap();
        assert_eq!(options.delay, Some(Duration::from_secs(2)));
        assert_eq!(options.max_attempts, Some(5));
        assert_eq!(options.headers.get("tenant").map(String::as_str), Some("acme"));
        assert!(options.dead_letter.is_none());
    }
}
