//! Delivery handler that forwards queue messages to the connected peer.

use std::sync::Weak;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    broker::DeliveryMetadata,
    dispatch::{DeliveryHandler, DispatchError},
    fragment::{ERROR_COMMAND, MessageId},
    message::LogicalMessage,
    session::Session,
};

/// Command of requests carrying a queue delivery to the peer.
pub const QUEUE_MESSAGE_COMMAND: &str = "queuemessage";

/// Envelope sent to the peer for each delivery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "replyto", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "queuename", default)]
    pub queue_name: String,
    #[serde(rename = "consumerTag", default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
    #[serde(rename = "routingkey", default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
}

impl QueueMessage {
    /// Wrap a delivery, decoding JSON payloads and keeping others as text.
    #[must_use]
    pub fn from_delivery(payload: String, metadata: DeliveryMetadata) -> Self {
        let data = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
        Self {
            data,
            reply_to: metadata.reply_to,
            error: None,
            correlation_id: metadata.correlation_id,
            queue_name: metadata.queue,
            consumer_tag: metadata.consumer_tag,
            routing_key: metadata.routing_key,
            exchange: metadata.exchange,
        }
    }
}

/// Forwards each delivery to the session's peer and waits for its answer.
///
/// Holds the session weakly; deliveries arriving after the session is gone
/// fail and are requeued.
#[derive(Clone, Debug)]
pub struct PeerDeliveryHandler {
    session: Weak<Session>,
}

impl PeerDeliveryHandler {
    #[must_use]
    pub fn new(session: Weak<Session>) -> Self { Self { session } }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DeliveryHandler for PeerDeliveryHandler {
    async fn handle(
        &self,
        payload: String,
        metadata: DeliveryMetadata,
    ) -> Result<String, DispatchError> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| DispatchError::new("session closed"))?;

        let id = MessageId::generate();
        let mut envelope = QueueMessage::from_delivery(payload, metadata);
        if envelope.correlation_id.as_deref().is_none_or(str::is_empty) {
            envelope.correlation_id = Some(id.to_string());
        }
        let body = serde_json::to_string(&envelope)?;
        let request = LogicalMessage::new(QUEUE_MESSAGE_COMMAND, body).with_id(id);

        let reply = session.send_request(request).await?;
        if reply.command() == ERROR_COMMAND {
            return Err(DispatchError::new(reply.into_data()));
        }
        debug!(queue = %envelope.queue_name, "peer handled queue message");
        match serde_json::from_str::<QueueMessage>(reply.data()) {
            Ok(answer) => match answer.error {
                Some(error) if !error.is_empty() => Err(DispatchError::new(error)),
                _ => Ok(value_text(answer.data)),
            },
            Err(_) => Ok(reply.into_data()),
        }
    }
}
