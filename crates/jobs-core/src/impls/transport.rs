//! Errors raised by the network transports under the AMQP, SQS and
//! Beanstalk brokers.

use thiserror::Error;

use crate::domain::{JobsError, PipelineName};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend refused the message because of its size.
    #[error("message too large: {0}")]
    TooLarge(String),

    /// The delivery tag / receipt / job id is no longer known to the backend.
    #[error("unknown delivery handle")]
    UnknownHandle,
}

impl TransportError {
    pub fn connection(err: impl ToString) -> Self {
        TransportError::Connection(err.to_string())
    }

    /// Map to the service-level error. `UnknownHandle` is resolved by the
    /// caller (it knows the delivery) and only lands here as unavailability.
    pub fn into_jobs(self, pipeline: &PipelineName) -> JobsError {
        match self {
            TransportError::TooLarge(reason) => JobsError::InvalidJob(reason),
            other => JobsError::unavailable(pipeline, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_errors_are_not_retryable() {
        let pipeline = PipelineName::new("emails");
        let err = TransportError::TooLarge("65536 > 65535".into()).into_jobs(&pipeline);
        assert!(matches!(err, JobsError::InvalidJob(_)));

        let err = TransportError::connection("refused").into_jobs(&pipeline);
        assert!(err.is_retryable());
    }
}
