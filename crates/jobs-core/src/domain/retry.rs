//! Retry policy: decides backoff delays and the dead-letter target.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::JobsError;
use super::pipeline::PipelineName;

/// Retry policy for failed jobs.
///
/// Attached to a pipeline as its default and copied into every job at push
/// time, where push options may override individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total deliveries allowed before the job is dead-lettered (>= 1).
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff (>= 1.0).
    pub multiplier: f64,

    /// Upper bound for any computed or suggested delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Pipeline receiving jobs that exhausted their attempts; `None` discards them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<PipelineName>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            dead_letter: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next delivery.
    ///
    /// `attempts` is the number of failed attempts *before* the current one,
    /// so the first retry waits `base_delay`:
    /// delay = min(base_delay * multiplier^attempts, max_delay)
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - attempts 0 (first failure): 1s
    /// - attempts 1: 2s
    /// - attempts 2: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        self.cap(secs)
    }

    /// Clamp a worker-suggested delay to `max_delay`.
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }

    fn cap(&self, secs: f64) -> Duration {
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    pub fn validate(&self) -> Result<(), JobsError> {
        if self.max_attempts == 0 {
            return Err(JobsError::InvalidJob("max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(JobsError::InvalidJob(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.dead_letter.is_none());
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn exponential_backoff_increases(#[case] attempts: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        // overflow to infinity must not panic
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn matches_multiplier_from_attempt_count() {
        // base 4s, multiplier 2, one failed attempt so far -> 8s
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(8));
    }

    #[rstest]
    #[case::zero_attempts(0, 2.0)]
    #[case::shrinking(3, 0.5)]
    #[case::nan(3, f64::NAN)]
    fn rejects_invalid_policies(#[case] max_attempts: u32, #[case] multiplier: f64) {
        let policy = RetryPolicy {
            max_attempts,
            multiplier,
            ..RetryPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(JobsError::InvalidJob(_))));
    }

    #[test]
    fn deserializes_humantime_durations() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 5,
            "base_delay": "500ms",
            "max_delay": "1m",
            "dead_letter": "failed"
        }))
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.dead_letter, Some(PipelineName::new("failed")));
    }
}
