//! Boundary to the message broker backing queue consumers.
//!
//! The gateway never talks to a broker protocol directly. It consumes the
//! [`Broker`] trait to register and remove consumers, receives each message
//! as a [`QueuedDelivery`] through a [`Consumer`] callback, and settles it
//! through the delivery's [`Acknowledger`]. One broker client is shared by
//! every session in the process.

pub mod memory;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{DeliveryOutcome, MemoryBroker};

/// Failures reported by a broker client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A consumer is already attached to the queue.
    #[error("queue {0} already has a consumer")]
    ConsumerExists(String),
    /// No consumer is attached to the queue.
    #[error("queue {0} has no consumer")]
    UnknownQueue(String),
    /// The delivery was already acknowledged or rejected.
    #[error("delivery {0} was already settled")]
    AlreadySettled(u64),
    /// The broker could not be reached or refused the operation.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Queue-assert options passed through to the broker.
///
/// The gateway only sets [`QueueOptions::auto_delete`]; everything else comes
/// from [`Broker::default_queue_options`] untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

/// Routing metadata attached to a delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub queue: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub routing_key: Option<String>,
    pub exchange: Option<String>,
    pub consumer_tag: Option<String>,
}

/// Settlement handle for one delivery.
///
/// Exactly one of [`ack`](Acknowledger::ack) or [`nack`](Acknowledger::nack)
/// should be called, followed by [`done`](Acknowledger::done) with the
/// processing result.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Confirm successful processing.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the delivery, asking the broker to redeliver when `requeue` is set.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    /// Report the processing result to the broker client.
    async fn done(&self, result: String);
}

/// A broker message delivered to a registered queue.
pub struct QueuedDelivery {
    pub payload: String,
    pub metadata: DeliveryMetadata,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for QueuedDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedDelivery")
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Callback invoked by the broker for every delivery on a queue.
///
/// Deliveries may be handed over concurrently; implementations must not
/// assume one delivery finishes before the next starts.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn on_delivery(&self, delivery: QueuedDelivery);
}

/// Process-wide broker client.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Attach `consumer` to `queue`, asserting the queue with `options`.
    ///
    /// An empty `queue` asks the broker to name the queue. Returns the
    /// effective queue name.
    async fn add_consumer(
        &self,
        queue: &str,
        options: QueueOptions,
        credentials: Option<&str>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, BrokerError>;

    /// Detach the consumer from `queue`.
    async fn remove_consumer(&self, queue: &str) -> Result<(), BrokerError>;

    /// Options applied to every queue this gateway asserts.
    fn default_queue_options(&self) -> QueueOptions { QueueOptions::default() }
}
