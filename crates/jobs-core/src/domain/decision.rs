//! Decision model: what happens to a delivery after the worker reports.
//!
//! This module defines the Decision type (what to do next) and the Decider
//! trait (how to get there from a job and its outcome).

use std::time::Duration;

use super::job::Job;
use super::outcome::Outcome;
use super::pipeline::PipelineName;
use super::state::DeliveryState;

/// The next action to take for a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Remove the job from its pipeline.
    Ack,

    /// Return the job to its pipeline after a delay.
    Retry { delay: Duration, reason: String },

    /// Remove the job and hand a copy to `target` (or drop it if `None`).
    DeadLetter {
        target: Option<PipelineName>,
        reason: String,
    },
}

impl Decision {
    pub fn state(&self) -> DeliveryState {
        match self {
            Decision::Ack => DeliveryState::Acked,
            Decision::Retry { .. } => DeliveryState::NackRequeued,
            Decision::DeadLetter { .. } => DeliveryState::NackDeadLettered,
        }
    }
}

/// Trait for deciding the next action based on a job and its outcome.
///
/// Deciders are pure functions: given the current state and observation,
/// they return the next action without side effects. The consumer loop
/// carries the decision out against the broker.
pub trait Decider: Send + Sync {
    fn decide(&self, job: &Job, outcome: &Outcome) -> Decision;

    /// Decision for a job delivered with no attempts left (e.g. after
    /// repeated visibility timeouts); it must not run again.
    fn exhausted(&self, job: &Job) -> Decision {
        Decision::DeadLetter {
            target: job.dead_letter().cloned(),
            reason: format!(
                "delivered with no attempts left: {}/{}",
                job.attempts(),
                job.max_attempts()
            ),
        }
    }
}

/// Attempt-based retry with exponential backoff:
/// - Retry if attempts + 1 < max_attempts
/// - Dead-letter once the current attempt is the last one
/// - Dead-letter immediately on non-retryable failures
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, job: &Job, outcome: &Outcome) -> Decision {
        if outcome.is_success() {
            return Decision::Ack;
        }

        let reason = outcome.reason();
        if !outcome.retryable {
            return Decision::DeadLetter {
                target: job.dead_letter().cloned(),
                reason: format!("non-retryable failure: {reason}"),
            };
        }

        let failed = job.attempts().saturating_add(1);
        if failed >= job.max_attempts() {
            Decision::DeadLetter {
                target: job.dead_letter().cloned(),
                reason: format!(
                    "max attempts reached: {}/{}: {reason}",
                    failed,
                    job.max_attempts()
                ),
            }
        } else {
            let policy = job.retry();
            let delay = outcome
                .retry_after
                .map(|d| policy.clamp(d))
                .unwrap_or_else(|| policy.next_delay(job.attempts()));
            Decision::Retry {
                delay,
                reason: format!(
                    "retry attempt {}/{} after {:?}: {reason}",
                    failed + 1,
                    job.max_attempts(),
                    delay
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::JobId;
    use crate::domain::retry::RetryPolicy;
    use chrono::Utc;
    use ulid::Ulid;

    fn job_with(attempts: u32, dead_letter: Option<&str>) -> Job {
        let retry = RetryPolicy {
            max_attempts: 3,
            dead_letter: dead_letter.map(PipelineName::new),
            ..RetryPolicy::default()
        };
        let mut job = Job::new(
            JobId::from_ulid(Ulid::new()),
            PipelineName::new("emails"),
            &b"{}"[..],
            retry,
            Utc::now(),
        );
        job.observe_attempts(attempts);
        job
    }

    #[test]
    fn success_acks() {
        let decision = DefaultDecider.decide(&job_with(0, None), &Outcome::success());
        assert_eq!(decision, Decision::Ack);
        assert_eq!(decision.state(), DeliveryState::Acked);
    }

    #[test]
    fn failure_retries_with_backoff() {
        let d0 = DefaultDecider.decide(&job_with(0, None), &Outcome::failure("e"));
        let d1 = DefaultDecider.decide(&job_with(1, None), &Outcome::failure("e"));
        match (d0, d1) {
            (Decision::Retry { delay: a, .. }, Decision::Retry { delay: b, .. }) => {
                assert_eq!(a, Duration::from_secs(1));
                assert_eq!(b, Duration::from_secs(2));
            }
            other => panic!("expected retries, got {other:?}"),
        }
    }

    #[test]
    fn last_attempt_dead_letters() {
        let decision = DefaultDecider.decide(&job_with(2, Some("failed")), &Outcome::failure("e"));
        match decision {
            Decision::DeadLetter { target, reason } => {
                assert_eq!(target, Some(PipelineName::new("failed")));
                assert!(reason.contains("3/3"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn non_retryable_failure_skips_retries() {
        let decision = DefaultDecider.decide(&job_with(0, None), &Outcome::fatal("bad input"));
        assert!(matches!(decision, Decision::DeadLetter { target: None, .. }));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let outcome = Outcome::failure("slow down").with_retry_after(Duration::from_secs(3600));
        match DefaultDecider.decide(&job_with(0, None), &outcome) {
            Decision::Retry { delay, .. } => assert_eq!(delay, RetryPolicy::default().max_delay),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_delivery_goes_to_dead_letter() {
        let decision = DefaultDecider.exhausted(&job_with(3, Some("failed")));
        assert_eq!(decision.state(), DeliveryState::NackDeadLettered);
    }
}
