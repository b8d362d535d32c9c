// Invocation publisher for NATS JetStream

use crate::blob_path::RouteParams;
use crate::errors::QueueError;
use crate::queue::causality::CausalityCodec;
use crate::queue::nats::NatsClient;
use crate::trigger::{FunctionInvoker, TriggeredInvocation};
use async_nats::jetstream::context::PublishAckFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Message body sent to executors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationMessage {
    /// Id of the invocation this message requests
    pub invocation_id: Uuid,
    pub function: String,
    pub account: String,
    pub container: String,
    pub blob: String,
    pub route_params: RouteParams,
    pub published_at: DateTime<Utc>,
}

impl From<&TriggeredInvocation> for InvocationMessage {
    fn from(invocation: &TriggeredInvocation) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            function: invocation.function.clone(),
            account: invocation.blob.account().name().to_string(),
            container: invocation.blob.container_name().to_string(),
            blob: invocation.blob.name.clone(),
            route_params: invocation.route_params.clone(),
            published_at: Utc::now(),
        }
    }
}

impl InvocationMessage {
    /// Serialized body, wrapped in a causality envelope when a parent is known
    pub fn to_body(&self, parent_id: Option<Uuid>) -> Result<Vec<u8>, QueueError> {
        let json = serde_json::to_vec(self).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize invocation: {}", e))
        })?;
        match parent_id {
            Some(parent) => Ok(CausalityCodec::encode(parent, &json)?),
            None => Ok(json),
        }
    }

    /// Parse a body produced by [`InvocationMessage::to_body`]
    pub fn from_body(body: &[u8]) -> Result<(Self, Option<Uuid>), QueueError> {
        let token = CausalityCodec::decode_or_raw(body);
        let message = serde_json::from_slice(&token.payload).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to parse invocation: {}", e))
        })?;
        Ok((message, token.owner))
    }
}

/// Publishes blob-triggered invocations to JetStream
pub struct NatsInvocationPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsInvocationPublisher {
    pub fn new(client: NatsClient) -> Self {
        let publish_timeout = Duration::from_secs(client.config().publish_timeout_seconds);
        Self {
            client,
            publish_timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject(&self, function: &str) -> String {
        format!("{}.{}", self.client.config().subject_prefix, function)
    }
}

#[async_trait::async_trait]
impl FunctionInvoker for NatsInvocationPublisher {
    #[instrument(skip(self, invocation), fields(
        function = %invocation.function,
        blob = %invocation.blob,
        parent_id = ?invocation.parent_id
    ))]
    async fn invoke(&self, invocation: TriggeredInvocation) -> Result<(), QueueError> {
        let message = InvocationMessage::from(&invocation);
        let payload = message.to_body(invocation.parent_id)?;
        let subject = self.subject(&invocation.function);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.invocation_id.to_string().as_str());
        headers.insert("Function", invocation.function.as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(_ack)) => {
                info!(
                    subject = %subject,
                    invocation_id = %message.invocation_id,
                    "Invocation published"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountIdentity, BlobIdentity};

    fn invocation(parent_id: Option<Uuid>) -> TriggeredInvocation {
        let mut route_params = RouteParams::new();
        route_params.insert("name".to_string(), "report".to_string());
        TriggeredInvocation {
            function: "convert".to_string(),
            blob: BlobIdentity::new(AccountIdentity::new("prod"), "input", "report.csv"),
            route_params,
            parent_id,
        }
    }

    #[test]
    fn test_message_from_invocation() {
        let message = InvocationMessage::from(&invocation(None));
        assert_eq!(message.function, "convert");
        assert_eq!(message.account, "prod");
        assert_eq!(message.container, "input");
        assert_eq!(message.blob, "report.csv");
        assert_eq!(message.route_params.get("name").map(String::as_str), Some("report"));
    }

    #[test]
    fn test_body_without_parent_is_plain_json() {
        let message = InvocationMessage::from(&invocation(None));
        let body = message.to_body(None).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["function"], "convert");

        let (parsed, parent) = InvocationMessage::from_body(&body).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parent, None);
    }

    #[test]
    fn test_body_with_parent_carries_causality() {
        let parent = Uuid::new_v4();
        let message = InvocationMessage::from(&invocation(Some(parent)));
        let body = message.to_body(Some(parent)).unwrap();

        let (parsed, decoded_parent) = InvocationMessage::from_body(&body).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(decoded_parent, Some(parent));
    }
}
