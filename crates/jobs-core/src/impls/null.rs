//! Null broker: accepts pushes, drops them, never delivers.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerStat, Job, JobId, JobsError, PipelineName};
use crate::ports::{Broker, Delivery};

pub const DRIVER: &str = "null";

pub struct NullBroker {
    pipeline: PipelineName,
}

impl NullBroker {
    pub fn new(pipeline: PipelineName) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Broker for NullBroker {
    fn driver(&self) -> &'static str {
        DRIVER
    }

    fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    async fn check(&self) -> Result<(), JobsError> {
        Ok(())
    }

    async fn push(&self, job: Job) -> Result<JobId, JobsError> {
        tracing::debug!(pipeline = %self.pipeline, job_id = %job.id(), "null broker dropped job");
        Ok(job.id())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>, JobsError> {
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn stat(&self) -> Result<BrokerStat, JobsError> {
        Ok(BrokerStat::default())
    }

    async fn stop(&self) -> Result<(), JobsError> {
        Ok(())
    }
}
