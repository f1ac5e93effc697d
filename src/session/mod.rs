//! Per-connection session state.
//!
//! A [`Session`] owns everything tied to one peer connection: the inbound
//! [`ReassemblyBuffer`], the [`CorrelationTable`] of outstanding requests,
//! the FIFO queue of outbound fragments, and the [`QueueBridge`] holding the
//! connection's broker consumers. Mutable state sits behind a single lock per
//! session; the lock is never held across an await point.
//!
//! Inbound fragments arrive through [`Session::receive_fragment`] (usually
//! driven by [`Session::serve`]). Completed replies resolve their waiting
//! request; every other message is handed to the [`Dispatcher`] on its own
//! task so a dispatcher may itself await [`Session::send_request`].

pub mod registry;

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use registry::{ConnectionId, SessionRegistry};

use crate::{
    broker::Broker,
    config::GatewayConfig,
    correlation::{CorrelationTable, RequestError},
    dispatch::{DeliveryHandler, Dispatcher},
    fragment::{
        ERROR_COMMAND,
        Fragment,
        FragmentMeta,
        Fragmenter,
        FrameError,
        MessageId,
        ReassemblyBuffer,
        ReassemblyError,
    },
    message::LogicalMessage,
    metrics::{self, Direction},
    queue::{ConsumerError, ConsumerRegistration, PeerDeliveryHandler, QueueBridge},
    scheduler::Scheduler,
};

/// Command of the liveness probe written by [`Session::ping`].
pub const PING_COMMAND: &str = "ping";

/// Outbound half of a peer connection.
///
/// Each call to [`Transport::send`] writes one serialized fragment.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, raw: String) -> io::Result<()>;

    async fn close(&self) -> io::Result<()>;
}

/// What the peer told us about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client class, such as `nodered`, `webapp` or `web`.
    pub agent: String,
    pub version: String,
    pub remote_addr: Option<SocketAddr>,
    /// Token passed to the broker when registering consumers.
    pub credentials: Option<String>,
}

/// Result of admitting one inbound fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The fragment was buffered; its message is not complete yet.
    Incomplete,
    /// A completed reply resolved the pending request with this identity.
    Resolved(MessageId),
    /// A completed message with this identity was handed to the dispatcher.
    Dispatched(MessageId),
}

/// Failure to accept an inbound fragment.
///
/// None of these close the session.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
}

struct SessionState {
    reassembly: ReassemblyBuffer,
    correlations: CorrelationTable,
    send_queue: VecDeque<Fragment>,
    closed: bool,
}

/// State and behaviour of one peer connection.
pub struct Session {
    id: ConnectionId,
    info: RwLock<ClientInfo>,
    config: GatewayConfig,
    fragmenter: Fragmenter,
    state: Mutex<SessionState>,
    flush_lock: tokio::sync::Mutex<()>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    bridge: QueueBridge,
    scheduler: Scheduler,
    closed: CancellationToken,
}

impl Session {
    /// Start building a session writing to `transport`.
    #[must_use]
    pub fn builder(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn Dispatcher>,
        broker: Arc<dyn Broker>,
    ) -> SessionBuilder {
        SessionBuilder {
            transport,
            dispatcher,
            broker,
            config: GatewayConfig::default(),
            client_info: ClientInfo::default(),
            connection_id: None,
            delivery_handler: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig { &self.config }

    #[must_use]
    pub fn client_info(&self) -> ClientInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the client metadata, e.g. after the peer signs in.
    pub fn set_client_info(&self, info: ClientInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.state().closed }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize { self.state().correlations.len() }

    /// Number of fragments waiting to be written.
    #[must_use]
    pub fn queued_fragments(&self) -> usize { self.state().send_queue.len() }

    /// Number of fragments buffered for incomplete inbound messages.
    #[must_use]
    pub fn buffered_fragments(&self) -> usize { self.state().reassembly.buffered_fragments() }

    /// Queues this session consumes from.
    #[must_use]
    pub fn queues(&self) -> Vec<String> { self.bridge.queues() }

    /// Registration of the consumer on `queue`, if tracked.
    #[must_use]
    pub fn consumer(&self, queue: &str) -> Option<ConsumerRegistration> {
        self.bridge.registration(queue)
    }

    /// Decode and admit one raw fragment from the peer.
    ///
    /// A malformed fragment is answered with a best-effort `error` frame and
    /// reported; the connection stays open. A completed reply resolves its
    /// pending request; any other completed message, including a reply
    /// nobody waits for, is dispatched on a separate task.
    ///
    /// # Errors
    ///
    /// Returns [`InboundError::Frame`] for undecodable input,
    /// [`InboundError::Reassembly`] when the fragment's group was discarded,
    /// and [`InboundError::Closed`] after [`Session::close`].
    pub async fn receive_fragment(self: &Arc<Self>, raw: &str) -> Result<Inbound, InboundError> {
        if self.is_closed() {
            return Err(InboundError::Closed);
        }
        metrics::inc_fragments(Direction::Inbound);

        let fragment = match Fragment::from_wire(raw) {
            Ok(fragment) => fragment,
            Err(err) => {
                error!(connection = %self.id, error = %err, "malformed frame");
                if let Err(send_err) = self.send_reply(malformed_frame_reply(raw, &err)).await {
                    warn!(
                        connection = %self.id,
                        error = %send_err,
                        "failed to report malformed frame"
                    );
                }
                return Err(err.into());
            }
        };
        debug!(
            identity = %fragment.identity(),
            index = fragment.index(),
            count = fragment.count(),
            "fragment received"
        );

        let completed = self.state().reassembly.admit(fragment)?;
        let Some(message) = completed else {
            return Ok(Inbound::Incomplete);
        };
        Ok(self.route(message))
    }

    fn route(self: &Arc<Self>, message: LogicalMessage) -> Inbound {
        if let Some(reply_to) = message.reply_to_id().filter(|_| message.is_reply()).cloned() {
            let mut state = self.state();
            if state.correlations.contains(&reply_to) {
                state.correlations.resolve(&reply_to, message);
                return Inbound::Resolved(reply_to);
            }
            drop(state);
            warn!(connection = %self.id, %reply_to, "unsolicited reply; dispatching");
        }
        let identity = message.id().clone();
        self.dispatch(message);
        Inbound::Dispatched(identity)
    }

    fn dispatch(self: &Arc<Self>, message: LogicalMessage) {
        let session = Arc::clone(self);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let request = LogicalMessage::new(message.command(), "").with_id(message.id().clone());
            if let Err(err) = dispatcher.process(message, Arc::clone(&session)).await {
                warn!(identity = %request.id(), error = %err, "dispatch failed");
                let reply =
                    LogicalMessage::reply_to(&request, err.message()).with_error(err.message());
                if let Err(send_err) = session.send_reply(reply).await {
                    debug!(
                        identity = %request.id(),
                        error = %send_err,
                        "dispatch failure not reported"
                    );
                }
            }
        });
    }

    /// Send `message` to the peer and wait for its reply.
    ///
    /// An identity is generated when the message has none. Resolves when a
    /// reply marked with the identity arrives, when the session closes, or
    /// when the configured request timeout elapses.
    ///
    /// # Errors
    ///
    /// - [`RequestError::NotARequest`] when `message` is itself a reply;
    ///   nothing is sent.
    /// - [`RequestError::ConnectionClosed`] when the session is or becomes closed.
    /// - [`RequestError::Remote`] when the reply carries error text.
    /// - [`RequestError::TimedOut`] when no reply arrives in time.
    pub async fn send_request(
        &self,
        message: LogicalMessage,
    ) -> Result<LogicalMessage, RequestError> {
        if message.is_reply() {
            return Err(RequestError::NotARequest(message.id().clone()));
        }
        let batch = self.fragmenter.fragment(&message)?;
        let identity = batch.message_id().clone();
        let pending = {
            let mut state = self.state();
            if state.closed {
                return Err(RequestError::ConnectionClosed);
            }
            let pending = state.correlations.register(identity.clone());
            state.send_queue.extend(batch);
            pending
        };
        debug!(connection = %self.id, %identity, "request sent");
        self.flush_send_queue().await;

        let Some(timeout) = self.config.request_timeout else {
            return pending.await;
        };
        if let Ok(outcome) = tokio::time::timeout(timeout, pending).await {
            outcome
        } else {
            self.state().correlations.forget(&identity);
            warn!(connection = %self.id, %identity, ?timeout, "request timed out");
            Err(RequestError::TimedOut(identity))
        }
    }

    /// Send `message` without waiting for an answer.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::ConnectionClosed`] when the session is closed
    /// and [`RequestError::Fragmentation`] when the payload cannot be split.
    pub async fn send_reply(&self, message: LogicalMessage) -> Result<(), RequestError> {
        let batch = self.fragmenter.fragment(&message)?;
        {
            let mut state = self.state();
            if state.closed {
                return Err(RequestError::ConnectionClosed);
            }
            state.send_queue.extend(batch);
        }
        self.flush_send_queue().await;
        Ok(())
    }

    /// Write queued fragments to the transport in the order they were queued.
    ///
    /// A fragment whose write fails is logged and dropped. Returns the number
    /// of fragments written.
    pub async fn flush_send_queue(&self) -> usize {
        let _flushing = self.flush_lock.lock().await;
        let mut written = 0;
        loop {
            let Some(fragment) = self.state().send_queue.pop_front() else {
                break;
            };
            let raw = match fragment.to_wire() {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(
                        identity = %fragment.identity(),
                        error = %err,
                        "dropping unencodable fragment"
                    );
                    continue;
                }
            };
            match self.transport.send(raw).await {
                Ok(()) => {
                    written += 1;
                    metrics::inc_fragments(Direction::Outbound);
                    debug!(
                        identity = %fragment.identity(),
                        index = fragment.index(),
                        count = fragment.count(),
                        "fragment written"
                    );
                }
                Err(err) => warn!(
                    connection = %self.id,
                    identity = %fragment.identity(),
                    index = fragment.index(),
                    error = %err,
                    "write failed; fragment dropped"
                ),
            }
        }
        written
    }

    /// Probe the connection with a `ping` frame.
    ///
    /// Returns `false` when the session is closed or the write fails; in that
    /// case queued traffic is discarded and consumers are closed.
    pub async fn ping(&self) -> bool {
        if !self.is_closed() {
            let meta = FragmentMeta {
                identity: MessageId::generate(),
                command: PING_COMMAND.to_owned(),
                ..FragmentMeta::default()
            };
            let written = match Fragment::new(meta, 0, 1, "").to_wire() {
                Ok(raw) => {
                    let _flushing = self.flush_lock.lock().await;
                    self.transport.send(raw).await.map_err(|err| err.to_string())
                }
                Err(err) => Err(err.to_string()),
            };
            match written {
                Ok(()) => return true,
                Err(error) => warn!(connection = %self.id, %error, "ping failed"),
            }
        }
        {
            let mut state = self.state();
            state.send_queue.clear();
            state.reassembly.clear();
        }
        self.bridge.close_all_consumers().await;
        false
    }

    /// Start consuming from `name`, or from a generated queue when empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::SessionClosed`] once the session is closed,
    /// including when it closes while the broker registers the consumer.
    /// See [`QueueBridge::create_consumer`] for the rest.
    pub async fn create_consumer(
        &self,
        name: &str,
        auto_delete: bool,
    ) -> Result<String, ConsumerError> {
        if self.is_closed() {
            return Err(ConsumerError::SessionClosed);
        }
        let client = self.client_info();
        self.bridge.create_consumer(name, auto_delete, &client).await
    }

    /// Stop consuming from `queue`. Closing an unknown queue is a no-op.
    ///
    /// # Errors
    ///
    /// See [`QueueBridge::close_consumer`].
    pub async fn close_consumer(&self, queue: &str) -> Result<(), ConsumerError> {
        self.bridge.close_consumer(queue).await
    }

    /// Tear the session down.
    ///
    /// Consumers are closed best-effort and no new ones are accepted, pending
    /// requests are rejected with [`RequestError::ConnectionClosed`], delayed
    /// nacks are sent without waiting out their delay and the transport is
    /// closed. Later calls are no-ops.
    pub async fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.send_queue.clear();
            state.reassembly.clear();
        }
        self.closed.cancel();
        let consumers = self.bridge.shutdown().await;
        let cancelled = self.state().correlations.cancel_all();
        self.scheduler.shutdown();
        if let Err(err) = self.transport.close().await {
            warn!(connection = %self.id, error = %err, "failed to close transport");
        }
        metrics::dec_sessions();
        info!(connection = %self.id, consumers, cancelled, "session closed");
    }

    /// Feed every item of `inbound` to the session, then close it.
    ///
    /// Stream errors are logged and skipped. Returns when the stream ends or
    /// the session is closed from elsewhere.
    pub async fn serve<S>(self: Arc<Self>, inbound: S)
    where
        S: Stream<Item = io::Result<String>> + Send,
    {
        info!(connection = %self.id, agent = %self.client_info().agent, "session opened");
        let mut inbound = std::pin::pin!(inbound);
        loop {
            let item = tokio::select! {
                biased;
                () = self.closed.cancelled() => break,
                item = inbound.next() => item,
            };
            match item {
                Some(Ok(raw)) => {
                    if let Err(err) = self.receive_fragment(&raw).await {
                        debug!(connection = %self.id, error = %err, "inbound fragment rejected");
                    }
                }
                Some(Err(err)) => warn!(connection = %self.id, error = %err, "transport error"),
                None => break,
            }
        }
        self.close().await;
    }
}

fn malformed_frame_reply(raw: &str, err: &FrameError) -> LogicalMessage {
    let text = err.to_string();
    let reply = LogicalMessage::new(ERROR_COMMAND, text.clone()).with_error(text);
    let identity = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("id")?.as_str().map(MessageId::from))
        .filter(|id| !id.is_empty());
    match identity {
        Some(id) => reply.with_id(id.clone()).with_reply_to(id),
        None => reply,
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    broker: Arc<dyn Broker>,
    config: GatewayConfig,
    client_info: ClientInfo,
    connection_id: Option<ConnectionId>,
    delivery_handler: Option<Arc<dyn DeliveryHandler>>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn client_info(mut self, info: ClientInfo) -> Self {
        self.client_info = info;
        self
    }

    #[must_use]
    pub fn connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Handle queue deliveries with `handler`.
    ///
    /// By default deliveries are forwarded to the peer through a
    /// [`PeerDeliveryHandler`].
    #[must_use]
    pub fn delivery_handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.delivery_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Session> {
        let Self {
            transport,
            dispatcher,
            broker,
            config,
            client_info,
            connection_id,
            delivery_handler,
        } = self;
        let id = connection_id.unwrap_or_else(ConnectionId::next);
        metrics::inc_sessions();
        Arc::new_cyclic(|weak| {
            let handler: Arc<dyn DeliveryHandler> = match delivery_handler {
                Some(handler) => handler,
                None => Arc::new(PeerDeliveryHandler::new(weak.clone())),
            };
            let scheduler = Scheduler::new();
            let bridge =
                QueueBridge::new(broker, handler, scheduler.clone(), config.requeue_delay);
            let reassembly = ReassemblyBuffer::new(config.max_buffered_fragments)
                .with_timeout(config.reassembly_timeout);
            Session {
                id,
                info: RwLock::new(client_info),
                config,
                fragmenter: Fragmenter::new(config.max_fragment_size),
                state: Mutex::new(SessionState {
                    reassembly,
                    correlations: CorrelationTable::new(),
                    send_queue: VecDeque::new(),
                    closed: false,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
                transport,
                dispatcher,
                bridge,
                scheduler,
                closed: CancellationToken::new(),
            }
        })
    }
}
