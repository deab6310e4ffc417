//! aws-sdk-sqs backed transport. Credentials come from the default AWS
//! provider chain (env, profile, instance role...).

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::operation::change_message_visibility::ChangeMessageVisibilityError;
use aws_sdk_sqs::operation::delete_message::DeleteMessageError;
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};

use super::{SqsMessage, SqsTransport};
use crate::domain::BrokerStat;
use crate::impls::transport::TransportError;

pub struct AwsSqsTransport {
    client: Client,
}

impl AwsSqsTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the shared AWS config, with optional region / endpoint overrides.
    pub async fn from_env(region: Option<String>, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }
}

/// Whole seconds, rounded up.
fn secs(d: Duration) -> i32 {
    let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
    i32::try_from(secs).unwrap_or(i32::MAX)
}

fn count(attributes: &std::collections::HashMap<QueueAttributeName, String>, name: &QueueAttributeName) -> u64 {
    attributes
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl SqsTransport for AwsSqsTransport {
    async fn resolve_queue(&self, name: &str, create: bool) -> Result<String, TransportError> {
        let found = self.client.get_queue_url().queue_name(name).send().await;
        match found {
            Ok(out) => out
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| TransportError::Protocol("GetQueueUrl returned no url".into())),
            Err(err) => match err.into_service_error() {
                GetQueueUrlError::QueueDoesNotExist(_) if create => {
                    tracing::info!(queue = name, "creating sqs queue");
                    let out = self
                        .client
                        .create_queue()
                        .queue_name(name)
                        .send()
                        .await
                        .map_err(|e| TransportError::connection(DisplayErrorContext(e)))?;
                    out.queue_url()
                        .map(str::to_string)
                        .ok_or_else(|| TransportError::Protocol("CreateQueue returned no url".into()))
                }
                other => Err(TransportError::connection(DisplayErrorContext(other))),
            },
        }
    }

    async fn send(&self, queue_url: &str, body: String, delay: Duration) -> Result<(), TransportError> {
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .delay_seconds(secs(delay))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::connection(DisplayErrorContext(e)))
    }

    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<SqsMessage>, TransportError> {
        let out = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(secs(wait))
            .visibility_timeout(secs(visibility))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| TransportError::connection(DisplayErrorContext(e)))?;

        let Some(message) = out.messages().first() else {
            return Ok(None);
        };
        let (Some(receipt_handle), Some(body)) = (message.receipt_handle(), message.body()) else {
            return Err(TransportError::Protocol(
                "message without receipt handle or body".into(),
            ));
        };
        let receive_count = message
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Ok(Some(SqsMessage {
            receipt_handle: receipt_handle.to_string(),
            body: body.to_string(),
            receive_count,
        }))
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| match e.into_service_error() {
                DeleteMessageError::ReceiptHandleIsInvalid(_) => TransportError::UnknownHandle,
                other => TransportError::connection(DisplayErrorContext(other)),
            })
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs(timeout))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| match e.into_service_error() {
                ChangeMessageVisibilityError::ReceiptHandleIsInvalid(_)
                | ChangeMessageVisibilityError::MessageNotInflight(_) => TransportError::UnknownHandle,
                other => TransportError::connection(DisplayErrorContext(other)),
            })
    }

    async fn stat(&self, queue_url: &str) -> Result<BrokerStat, TransportError> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| TransportError::connection(DisplayErrorContext(e)))?;

        let Some(attributes) = out.attributes() else {
            return Ok(BrokerStat::default());
        };
        Ok(BrokerStat {
            active: count(attributes, &QueueAttributeName::ApproximateNumberOfMessages),
            delayed: count(attributes, &QueueAttributeName::ApproximateNumberOfMessagesDelayed),
            reserved: count(attributes, &QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        })
    }
}
