//! Broker-backed queue consumers owned by a session.
//!
//! [`QueueBridge`] registers and removes consumers on the shared [`Broker`]
//! and tracks which queues the session listens on. Every delivery runs
//! through the acknowledge protocol: a successful
//! [`DeliveryHandler`](crate::dispatch::DeliveryHandler) call is acknowledged
//! at once, a failed one is negatively acknowledged with requeue only after
//! the configured delay so a poison message cannot spin in a tight loop.

mod peer;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

pub use peer::{PeerDeliveryHandler, QUEUE_MESSAGE_COMMAND, QueueMessage};

use crate::{
    broker::{Broker, BrokerError, Consumer, QueuedDelivery},
    dispatch::DeliveryHandler,
    fragment::id::random_base36,
    metrics,
    scheduler::Scheduler,
    session::ClientInfo,
};

const ANONYMOUS_SUFFIX_LEN: usize = 9;

/// Failure to register or remove a consumer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConsumerError {
    /// The session already consumes from the queue.
    #[error("already consuming from {0}")]
    AlreadyRegistered(String),
    /// The owning session is closed; no consumer was left on the broker.
    #[error("session is closed")]
    SessionClosed,
    /// The broker refused the registration.
    #[error("failed to register consumer on {queue}: {source}")]
    Register {
        queue: String,
        #[source]
        source: BrokerError,
    },
    /// The broker refused to remove the consumer.
    #[error("failed to remove consumer on {queue}: {source}")]
    Deregister {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

/// Lifecycle of a tracked consumer. Untracked queues are unregistered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Registered,
    Unregistering,
}

/// A queue the session consumes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub queue_name: String,
    pub auto_delete: bool,
    pub state: ConsumerState,
}

/// Queue prefix used for anonymous consumers of the given client class.
#[must_use]
pub fn queue_prefix(agent: &str) -> &'static str {
    match agent {
        "nodered" => "nodered",
        "webapp" => "webapp",
        "web" => "web",
        _ => "unknown",
    }
}

/// Generate a queue name for an anonymous consumer.
#[must_use]
pub fn anonymous_queue_name(agent: &str) -> String {
    format!(
        "{}.{}",
        queue_prefix(agent),
        random_base36(ANONYMOUS_SUFFIX_LEN)
    )
}

#[derive(Default)]
struct Registrations {
    queues: HashMap<String, ConsumerRegistration>,
    shut_down: bool,
}

/// Consumer registrations of one session.
pub struct QueueBridge {
    broker: Arc<dyn Broker>,
    consumer: Arc<DeliveryConsumer>,
    registrations: Mutex<Registrations>,
}

impl QueueBridge {
    /// Create a bridge delivering through `handler`.
    ///
    /// Failed deliveries are nacked `requeue_delay` after the failure using
    /// `scheduler`; shutting the scheduler down sends those nacks at once.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn DeliveryHandler>,
        scheduler: Scheduler,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            broker,
            consumer: Arc::new(DeliveryConsumer {
                handler,
                scheduler,
                requeue_delay,
            }),
            registrations: Mutex::new(Registrations::default()),
        }
    }

    fn registrations(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start consuming from `name`, or from a generated queue when `name` is empty.
    ///
    /// Generated queues are prefixed with the client's class and are always
    /// auto-deleted. Returns the effective queue name.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::AlreadyRegistered`] when the session already
    /// consumes from the queue, [`ConsumerError::Register`] when the broker
    /// refuses the consumer and [`ConsumerError::SessionClosed`] after
    /// [`QueueBridge::shutdown`]. A consumer added while the bridge was shutting
    /// down is removed from the broker again before `SessionClosed` is returned.
    pub async fn create_consumer(
        &self,
        name: &str,
        auto_delete: bool,
        client: &ClientInfo,
    ) -> Result<String, ConsumerError> {
        let requested = name.trim();
        let (queue, auto_delete) = if requested.is_empty() {
            (anonymous_queue_name(&client.agent), true)
        } else {
            (requested.to_owned(), auto_delete)
        };
        {
            let registrations = self.registrations();
            if registrations.shut_down {
                return Err(ConsumerError::SessionClosed);
            }
            if registrations.queues.contains_key(&queue) {
                return Err(ConsumerError::AlreadyRegistered(queue));
            }
        }

        let mut options = self.broker.default_queue_options();
        options.auto_delete = auto_delete;
        let consumer: Arc<dyn Consumer> = self.consumer.clone();
        let effective = self
            .broker
            .add_consumer(&queue, options, client.credentials.as_deref(), consumer)
            .await
            .map_err(|source| ConsumerError::Register {
                queue: queue.clone(),
                source,
            })?;

        {
            let mut registrations = self.registrations();
            if !registrations.shut_down {
                registrations.queues.insert(
                    effective.clone(),
                    ConsumerRegistration {
                        queue_name: effective.clone(),
                        auto_delete,
                        state: ConsumerState::Registered,
                    },
                );
                info!(queue = %effective, auto_delete, "consumer registered");
                return Ok(effective);
            }
        }

        warn!(queue = %effective, "session closed during registration; removing consumer");
        if let Err(err) = self.broker.remove_consumer(&effective).await {
            error!(queue = %effective, error = %err, "failed to roll back consumer");
        }
        Err(ConsumerError::SessionClosed)
    }

    /// Stop consuming from `queue`.
    ///
    /// Closing a queue that is not tracked, or is already being closed, is a
    /// no-op. On failure the registration is kept so the close can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Deregister`] when the broker refuses.
    pub async fn close_consumer(&self, queue: &str) -> Result<(), ConsumerError> {
        {
            let mut registrations = self.registrations();
            match registrations.queues.get_mut(queue) {
                Some(registration) if registration.state == ConsumerState::Registered => {
                    registration.state = ConsumerState::Unregistering;
                }
                _ => return Ok(()),
            }
        }

        match self.broker.remove_consumer(queue).await {
            Ok(()) => {
                self.registrations().queues.remove(queue);
                info!(%queue, "consumer removed");
                Ok(())
            }
            Err(source) => {
                if let Some(registration) = self.registrations().queues.get_mut(queue) {
                    registration.state = ConsumerState::Registered;
                }
                Err(ConsumerError::Deregister {
                    queue: queue.to_owned(),
                    source,
                })
            }
        }
    }

    /// Close every tracked consumer, logging failures instead of returning them.
    ///
    /// Returns the number of consumers removed.
    pub async fn close_all_consumers(&self) -> usize {
        let queues = self.queues();
        let mut closed = 0;
        for queue in queues {
            match self.close_consumer(&queue).await {
                Ok(()) => closed += 1,
                Err(err) => error!(%queue, error = %err, "failed to close consumer"),
            }
        }
        closed
    }

    /// Refuse new consumers, then close every tracked one.
    ///
    /// Registrations still in flight are rolled back by
    /// [`QueueBridge::create_consumer`] once the broker answers.
    pub async fn shutdown(&self) -> usize {
        self.registrations().shut_down = true;
        self.close_all_consumers().await
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool { self.registrations().shut_down }

    /// Names of the queues currently tracked.
    #[must_use]
    pub fn queues(&self) -> Vec<String> { self.registrations().queues.keys().cloned().collect() }

    #[must_use]
    pub fn registration(&self, queue: &str) -> Option<ConsumerRegistration> {
        self.registrations().queues.get(queue).cloned()
    }
}

/// Broker callback applying the acknowledge protocol to each delivery.
struct DeliveryConsumer {
    handler: Arc<dyn DeliveryHandler>,
    scheduler: Scheduler,
    requeue_delay: Duration,
}

#[async_trait]
impl Consumer for DeliveryConsumer {
    async fn on_delivery(&self, delivery: QueuedDelivery) {
        let QueuedDelivery {
            payload,
            metadata,
            acker,
        } = delivery;
        let queue = metadata.queue.clone();

        match self.handler.handle(payload.clone(), metadata).await {
            Ok(result) => {
                if let Err(err) = acker.ack().await {
                    warn!(%queue, error = %err, "failed to acknowledge delivery");
                }
                metrics::inc_acks();
                acker.done(result).await;
            }
            Err(err) => {
                let delay = self.requeue_delay;
                warn!(
                    %queue,
                    error = %err,
                    ?delay,
                    "delivery failed; nack and requeue after delay"
                );
                self.scheduler.schedule(delay, async move {
                    if let Err(err) = acker.nack(true).await {
                        warn!(%queue, error = %err, "failed to reject delivery");
                    }
                    metrics::inc_nacks();
                    acker.done(payload).await;
                });
            }
        }
    }
}
