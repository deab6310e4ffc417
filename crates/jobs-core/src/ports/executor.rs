//! WorkerExecutor port - ワーカー実行の抽象化
//!
//! 実際のワーカープール（外部プロセスなど）はこの trait の向こう側にあります。
//! consumer loop はジョブを渡して Outcome を受け取るだけです。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Job, Outcome};

/// WorkerExecutor はジョブを実行して結果を返す
///
/// # 契約
/// - ジョブの失敗は `Outcome::failure` / `Outcome::fatal` で表す（Err は持たない）
/// - panic した場合は consumer loop が捕まえてリトライ可能な失敗として扱う
/// - 同じジョブが 2 回届くことがある（at-least-once）ので、冪等に実装すること
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Outcome;
}

#[async_trait]
impl<E: WorkerExecutor + ?Sized> WorkerExecutor for Arc<E> {
    async fn execute(&self, job: &Job) -> Outcome {
        (**self).execute(job).await
    }
}

/// Routes each job to the executor registered under its [`Job::name`].
///
/// Jobs without a registered name go to the fallback; with no fallback they
/// fail as fatal, since retrying cannot make a handler appear.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WorkerExecutor>>,
    fallback: Option<Arc<dyn WorkerExecutor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`.
    pub fn with_handler(mut self, name: impl Into<String>, executor: Arc<dyn WorkerExecutor>) -> Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), executor).is_some() {
            tracing::debug!(%name, "job handler replaced");
        }
        self
    }

    pub fn with_fallback(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn resolve(&self, name: &str) -> Option<&Arc<dyn WorkerExecutor>> {
        self.handlers.get(name).or(self.fallback.as_ref())
    }
}

#[async_trait]
impl WorkerExecutor for HandlerRegistry {
    async fn execute(&self, job: &Job) -> Outcome {
        match self.resolve(job.name()) {
            Some(executor) => executor.execute(job).await,
            None => {
                tracing::warn!(
                    pipeline = %job.pipeline(),
                    job_id = %job.id(),
                    name = job.name(),
                    "no handler for job"
                );
                Outcome::fatal(format!("no handler registered for job `{}`", job.name()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, PipelineName, RetryPolicy};
    use chrono::Utc;

    /// Answers with a fixed outcome.
    struct Answer(Outcome);

    #[async_trait]
    impl WorkerExecutor for Answer {
        async fn execute(&self, _job: &Job) -> Outcome {
            self.0.clone()
        }
    }

    fn job(name: &str) -> Job {
        Job::new(
            JobId::generate(),
            PipelineName::new("default"),
            &b"{}"[..],
            RetryPolicy::default(),
            Utc::now(),
        )
        .with_name(name)
    }

    #[tokio::test]
    async fn routes_by_job_name() {
        let registry = HandlerRegistry::new()
            .with_handler("mail.welcome", Arc::new(Answer(Outcome::success())))
            .with_handler("mail.digest", Arc::new(Answer(Outcome::failure("smtp down"))));

        assert!(registry.execute(&job("mail.welcome")).await.is_success());
        assert_eq!(registry.execute(&job("mail.digest")).await.reason(), "smtp down");
    }

    #[tokio::test]
    async fn unknown_names_are_fatal_without_fallback() {
        let registry =
            HandlerRegistry::new().with_handler("mail.welcome", Arc::new(Answer(Outcome::success())));

        let outcome = registry.execute(&job("report.build")).await;
        assert!(!outcome.is_success());
        assert!(!outcome.retryable);
        assert!(outcome.reason().contains("report.build"));
    }

    #[tokio::test]
    async fn unknown_and_unnamed_jobs_use_the_fallback() {
        let registry = HandlerRegistry::new()
            .with_handler("mail.welcome", Arc::new(Answer(Outcome::fatal("wrong handler"))))
            .with_fallback(Arc::new(Answer(Outcome::success())));

        assert!(registry.execute(&job("report.build")).await.is_success());
        assert!(registry.execute(&job("")).await.is_success());
        assert!(registry.has_handler("mail.welcome"));
        assert!(!registry.has_handler("report.build"));
    }
}
