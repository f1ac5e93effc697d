//! Boundary to business logic.
//!
//! The gateway only frames and correlates payloads. What a message means is
//! decided by a [`Dispatcher`] for peer requests and by a
//! [`DeliveryHandler`] for queue deliveries. Both report failure through
//! [`DispatchError`], whose text is sent back to the peer or logged before a
//! delivery is requeued.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    broker::DeliveryMetadata,
    correlation::RequestError,
    message::LogicalMessage,
    queue::ConsumerError,
    session::Session,
};

/// Failure raised by business dispatch.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DispatchError {
    message: String,
}

impl DispatchError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Failure text forwarded to the peer.
    #[must_use]
    pub fn message(&self) -> &str { &self.message }
}

impl From<RequestError> for DispatchError {
    fn from(error: RequestError) -> Self { Self::new(error.to_string()) }
}

impl From<ConsumerError> for DispatchError {
    fn from(error: ConsumerError) -> Self { Self::new(error.to_string()) }
}

impl From<serde_json::Error> for DispatchError {
    fn from(error: serde_json::Error) -> Self { Self::new(error.to_string()) }
}

/// Handles complete messages from a peer that are not correlated replies.
///
/// Implementations usually answer with [`Session::send_reply`]. Returning an
/// error makes the session send an error reply carrying the failure text.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn process(
        &self,
        message: LogicalMessage,
        session: Arc<Session>,
    ) -> Result<(), DispatchError>;
}

/// Handles one queue delivery and produces its result.
///
/// Success acknowledges the delivery; failure requeues it after the
/// configured delay.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: String,
        metadata: DeliveryMetadata,
    ) -> Result<String, DispatchError>;
}
