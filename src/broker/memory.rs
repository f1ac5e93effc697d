//! In-process [`Broker`] implementation.
//!
//! `MemoryBroker` keeps one consumer per queue and hands published payloads
//! straight to it. Settlement calls are recorded as [`DeliveryOutcome`]s so
//! callers can inspect what happened to each delivery. Requeued deliveries
//! are recorded but not redelivered automatically; call
//! [`MemoryBroker::publish`] again to simulate redelivery.

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{
    Acknowledger,
    Broker,
    BrokerError,
    Consumer,
    DeliveryMetadata,
    QueueOptions,
    QueuedDelivery,
};
use crate::fragment::id::random_base36;

/// What happened to a delivery after it was handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked {
        queue: String,
        tag: u64,
    },
    Nacked {
        queue: String,
        tag: u64,
        requeue: bool,
    },
    Done {
        queue: String,
        tag: u64,
        result: String,
    },
}

struct MemoryQueue {
    consumer: Arc<dyn Consumer>,
    options: QueueOptions,
    consumer_tag: String,
}

type OutcomeLog = Arc<Mutex<Vec<DeliveryOutcome>>>;

/// Broker that lives entirely inside the current process.
#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, MemoryQueue>,
    outcomes: OutcomeLog,
    next_tag: AtomicU64,
    defaults: QueueOptions,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Use `defaults` as the base options for every asserted queue.
    #[must_use]
    pub fn with_default_options(defaults: QueueOptions) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Deliver `payload` to the consumer attached to `metadata.queue`.
    ///
    /// The consumer runs inline on the caller's task. The call resolves once
    /// the consumer has accepted the delivery, which for the gateway means the
    /// ack has been sent or the delayed nack scheduled. With the default
    /// [`PeerDeliveryHandler`](crate::queue::PeerDeliveryHandler) that includes
    /// waiting for the peer's answer, so callers that must not block on a
    /// peer spawn the publish. Publishes from separate tasks are delivered
    /// concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownQueue`] when no consumer is attached.
    pub async fn publish(
        &self,
        payload: impl Into<String>,
        mut metadata: DeliveryMetadata,
    ) -> Result<u64, BrokerError> {
        let (consumer, consumer_tag) = {
            let queue = self
                .queues
                .get(&metadata.queue)
                .ok_or_else(|| BrokerError::UnknownQueue(metadata.queue.clone()))?;
            (Arc::clone(&queue.consumer), queue.consumer_tag.clone())
        };
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        metadata.consumer_tag.get_or_insert(consumer_tag);
        let acker = MemoryAcker {
            queue: metadata.queue.clone(),
            tag,
            settled: AtomicBool::new(false),
            outcomes: Arc::clone(&self.outcomes),
        };
        debug!(queue = %metadata.queue, tag, "delivering message");
        consumer
            .on_delivery(QueuedDelivery {
                payload: payload.into(),
                metadata,
                acker: Box::new(acker),
            })
            .await;
        Ok(tag)
    }

    /// Snapshot of every settlement recorded so far.
    #[must_use]
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn has_consumer(&self, queue: &str) -> bool { self.queues.contains_key(queue) }

    /// Options the queue was asserted with, if it has a consumer.
    #[must_use]
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.queues.get(queue).map(|q| q.options.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn add_consumer(
        &self,
        queue: &str,
        options: QueueOptions,
        _credentials: Option<&str>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, BrokerError> {
        let name = if queue.is_empty() {
            format!("amq.gen-{}", random_base36(12))
        } else {
            queue.to_owned()
        };
        match self.queues.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BrokerError::ConsumerExists(name)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(MemoryQueue {
                    consumer,
                    options,
                    consumer_tag: format!("ctag-{}", random_base36(8)),
                });
                Ok(name)
            }
        }
    }

    async fn remove_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        self.queues
            .remove(queue)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))
    }

    fn default_queue_options(&self) -> QueueOptions { self.defaults.clone() }
}

struct MemoryAcker {
    queue: String,
    tag: u64,
    settled: AtomicBool,
    outcomes: OutcomeLog,
}

impl MemoryAcker {
    fn settle(&self, outcome: DeliveryOutcome) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySettled(self.tag));
        }
        self.record(outcome);
        Ok(())
    }

    fn record(&self, outcome: DeliveryOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(DeliveryOutcome::Acked {
            queue: self.queue.clone(),
            tag: self.tag,
        })
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(DeliveryOutcome::Nacked {
            queue: self.queue.clone(),
            tag: self.tag,
            requeue,
        })
    }

    async fn done(&self, result: String) {
        self.record(DeliveryOutcome::Done {
            queue: self.queue.clone(),
            tag: self.tag,
            result,
        });
    }
}
