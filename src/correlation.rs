//! Per-session table matching outbound requests to inbound replies.
//!
//! [`CorrelationTable`] maps the identity of each outstanding request to the
//! sending half of a oneshot channel. The caller holds the receiving half as
//! a [`PendingReply`] future. Entries leave the table when a reply resolves
//! them, when the caller gives up, or when the session closes.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    fragment::{FragmentationError, MessageId},
    message::LogicalMessage,
};

/// Failures observed by a caller awaiting a reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The session closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,
    /// The peer answered with an error.
    #[error("{0}")]
    Remote(String),
    /// No reply arrived within the configured request timeout.
    #[error("request {0} timed out")]
    TimedOut(MessageId),
    /// Another request registered the same identity.
    #[error("request {0} was superseded by a request with the same identity")]
    Superseded(MessageId),
    /// A reply cannot itself be awaited.
    #[error("message {0} is a reply and cannot await one")]
    NotARequest(MessageId),
    /// The request could not be split into fragments.
    #[error(transparent)]
    Fragmentation(#[from] FragmentationError),
}

type ReplySender = oneshot::Sender<Result<LogicalMessage, RequestError>>;

/// Outstanding requests of one session keyed by identity.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<MessageId, ReplySender>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Track `identity` and return the future its reply resolves.
    ///
    /// Registering an identity that is already pending rejects the earlier
    /// waiter with [`RequestError::Superseded`].
    pub fn register(&mut self, identity: MessageId) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.insert(identity.clone(), tx) {
            warn!(%identity, "request identity reused while pending");
            let _ = previous.send(Err(RequestError::Superseded(identity.clone())));
        }
        PendingReply { identity, rx }
    }

    /// Hand `message` to the waiter registered under `identity`.
    ///
    /// A reply carrying error text rejects the waiter with
    /// [`RequestError::Remote`]. Returns `false` when nothing was waiting.
    pub fn resolve(&mut self, identity: &MessageId, message: LogicalMessage) -> bool {
        let Some(tx) = self.pending.remove(identity) else {
            return false;
        };
        let outcome = match message.error() {
            Some(error) => Err(RequestError::Remote(error.to_owned())),
            None => Ok(message),
        };
        if tx.send(outcome).is_err() {
            debug!(%identity, "reply arrived after the waiter was dropped");
        }
        true
    }

    /// Stop tracking `identity` without resolving it.
    pub fn forget(&mut self, identity: &MessageId) -> bool { self.pending.remove(identity).is_some() }

    /// Reject every pending waiter with [`RequestError::ConnectionClosed`].
    ///
    /// Returns the number of waiters rejected.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RequestError::ConnectionClosed));
        }
        cancelled
    }

    #[must_use]
    pub fn contains(&self, identity: &MessageId) -> bool { self.pending.contains_key(identity) }

    #[must_use]
    pub fn len(&self) -> usize { self.pending.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}

/// Future resolving to the reply for one request.
#[derive(Debug)]
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    identity: MessageId,
    rx: oneshot::Receiver<Result<LogicalMessage, RequestError>>,
}

impl PendingReply {
    /// Identity of the request awaiting this reply.
    pub fn identity(&self) -> &MessageId { &self.identity }
}

impl Future for PendingReply {
    type Output = Result<LogicalMessage, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::ConnectionClosed)))
    }
}
