//! Errors - エラー型と分類
//!
//! push / 管理系の呼び出しは `JobsError` をそのまま返します。
//! consumer loop の中で起きたエラーはプロセスを落とさず、ログと stat にだけ現れます。

use thiserror::Error;

use super::ids::{DeliveryId, JobId};
use super::pipeline::PipelineName;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（broker への接続障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum JobsError {
    /// Transport / connection failure talking to the backend.
    #[error("broker for pipeline `{pipeline}` is unavailable: {reason}")]
    BrokerUnavailable {
        pipeline: PipelineName,
        reason: String,
    },

    /// Payload or options rejected; never retried.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("unknown pipeline `{0}`")]
    UnknownPipeline(PipelineName),

    /// Ack/nack on a delivery whose reservation already lapsed.
    #[error("delivery handle {delivery} for job {job_id} has expired")]
    HandleExpired { delivery: DeliveryId, job_id: JobId },

    /// Informational: the job exhausted its retry budget.
    #[error("job {job_id} exhausted {attempts} attempts: {reason}")]
    DeadLettered {
        job_id: JobId,
        attempts: u32,
        target: Option<PipelineName>,
        reason: String,
    },

    #[error("pipeline `{0}` is already declared")]
    DuplicatePipeline(PipelineName),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("job codec error: {0}")]
    Codec(String),
}

impl JobsError {
    pub fn unavailable(pipeline: &PipelineName, reason: impl ToString) -> Self {
        JobsError::BrokerUnavailable {
            pipeline: pipeline.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobsError::BrokerUnavailable { .. } => ErrorKind::Infrastructure,
            JobsError::HandleExpired { .. } => ErrorKind::Transient,
            JobsError::InvalidJob(_)
            | JobsError::UnknownPipeline(_)
            | JobsError::DeadLettered { .. }
            | JobsError::DuplicatePipeline(_)
            | JobsError::Config(_)
            | JobsError::Codec(_) => ErrorKind::Permanent,
        }
    }

    /// Only transport failures are worth retrying at the connection layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Infrastructure)
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(err: serde_json::Error) -> Self {
        JobsError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn classifies_errors() {
        let pipeline = PipelineName::new("emails");
        assert_eq!(
            JobsError::unavailable(&pipeline, "connection refused").kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            JobsError::UnknownPipeline(pipeline).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            JobsError::HandleExpired {
                delivery: DeliveryId::from_ulid(Ulid::new()),
                job_id: JobId::from_ulid(Ulid::new()),
            }
            .kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        let pipeline = PipelineName::new("emails");
        assert!(JobsError::unavailable(&pipeline, "timeout").is_retryable());
        assert!(!JobsError::InvalidJob("too big".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_pipeline() {
        let err = JobsError::UnknownPipeline(PipelineName::new("missing"));
        assert_eq!(err.to_string(), "unknown pipeline `missing`");
    }
}
