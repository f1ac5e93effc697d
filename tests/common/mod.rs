//! Shared utilities for integration tests.
//!
//! Provides an in-memory [`Transport`] that records every written fragment,
//! dispatchers and delivery handlers with scripted behaviour, and a broker
//! wrapper that can refuse consumer removal.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use wiregate::{
    broker::{Broker, BrokerError, Consumer, DeliveryMetadata, MemoryBroker, QueueOptions},
    config::GatewayConfig,
    dispatch::{DeliveryHandler, DispatchError, Dispatcher},
    fragment::{Fragment, FragmentMeta, MessageId},
    message::LogicalMessage,
    session::{Session, Transport},
};

/// Transport capturing written fragments.
#[derive(Debug)]
pub struct RecordingTransport {
    written: mpsc::UnboundedSender<String>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, Written) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            written: tx,
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (transport, Written(rx))
    }

    /// Make every following write fail until reset.
    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, raw: String) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        self.written
            .send(raw)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "recorder dropped"))
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Receiving end of a [`RecordingTransport`].
pub struct Written(mpsc::UnboundedReceiver<String>);

impl Written {
    /// Wait for the next written fragment.
    pub async fn next_fragment(&mut self) -> Fragment {
        let raw = tokio::time::timeout(Duration::from_secs(5), self.0.recv())
            .await
            .expect("fragment written in time")
            .expect("transport alive");
        Fragment::from_wire(&raw).expect("written fragment decodes")
    }

    /// Fragments written so far without waiting.
    pub fn drain(&mut self) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        while let Ok(raw) = self.0.try_recv() {
            fragments.push(Fragment::from_wire(&raw).expect("written fragment decodes"));
        }
        fragments
    }
}

/// Dispatcher forwarding every message to a channel.
pub struct RecordingDispatcher(mpsc::UnboundedSender<LogicalMessage>);

impl RecordingDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LogicalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn process(
        &self,
        message: LogicalMessage,
        _session: Arc<Session>,
    ) -> Result<(), DispatchError> {
        self.0
            .send(message)
            .map_err(|_| DispatchError::new("recorder dropped"))
    }
}

/// Dispatcher that fails every message with a fixed text.
pub struct FailingDispatcher(pub &'static str);

#[async_trait]
impl Dispatcher for FailingDispatcher {
    async fn process(
        &self,
        _message: LogicalMessage,
        _session: Arc<Session>,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::new(self.0))
    }
}

/// Delivery handler failing payloads equal to `"fail"` and echoing others.
pub struct ScriptedHandler;

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    async fn handle(
        &self,
        payload: String,
        _metadata: DeliveryMetadata,
    ) -> Result<String, DispatchError> {
        if payload == "fail" {
            Err(DispatchError::new("handler refused"))
        } else {
            Ok(format!("handled:{payload}"))
        }
    }
}

/// Broker wrapper refusing to remove consumers of selected queues.
#[derive(Default)]
pub struct FlakyBroker {
    pub inner: MemoryBroker,
    stuck: Mutex<HashSet<String>>,
}

impl FlakyBroker {
    pub fn refuse_removal(&self, queue: &str) {
        self.stuck.lock().expect("stuck set").insert(queue.to_owned());
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn add_consumer(
        &self,
        queue: &str,
        options: QueueOptions,
        credentials: Option<&str>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, BrokerError> {
        self.inner
            .add_consumer(queue, options, credentials, consumer)
            .await
    }

    async fn remove_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        if self.stuck.lock().expect("stuck set").contains(queue) {
            return Err(BrokerError::Unavailable(format!("cannot cancel {queue}")));
        }
        self.inner.remove_consumer(queue).await
    }
}

/// Broker whose consumer registrations wait until released.
#[derive(Default)]
pub struct GatedBroker {
    pub inner: MemoryBroker,
    entered: Notify,
    release: Notify,
}

impl GatedBroker {
    /// Wait until a registration reaches the broker.
    pub async fn registration_started(&self) { self.entered.notified().await; }

    /// Let the waiting registration complete.
    pub fn release(&self) { self.release.notify_one(); }
}

#[async_trait]
impl Broker for GatedBroker {
    async fn add_consumer(
        &self,
        queue: &str,
        options: QueueOptions,
        credentials: Option<&str>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, BrokerError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner
            .add_consumer(queue, options, credentials, consumer)
            .await
    }

    async fn remove_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner.remove_consumer(queue).await
    }
}

/// Build a session over a [`RecordingTransport`].
pub fn session_with(
    config: GatewayConfig,
    dispatcher: Arc<dyn Dispatcher>,
    broker: Arc<dyn Broker>,
) -> (Arc<Session>, Arc<RecordingTransport>, Written) {
    let (transport, written) = RecordingTransport::new();
    let session = Session::builder(transport.clone(), dispatcher, broker)
        .config(config)
        .build();
    (session, transport, written)
}

/// Serialize a single-fragment message.
pub fn wire(identity: &str, reply_to: Option<&str>, command: &str, payload: &str) -> String {
    let meta = FragmentMeta {
        identity: MessageId::new(identity),
        reply_to: reply_to.map(MessageId::new),
        command: command.to_owned(),
        error: None,
    };
    Fragment::new(meta, 0, 1, payload)
        .to_wire()
        .expect("fragment encodes")
}

/// Serialize fragment `index` of a `count`-fragment message.
pub fn wire_part(identity: &str, command: &str, index: u32, count: u32, payload: &str) -> String {
    let meta = FragmentMeta {
        identity: MessageId::new(identity),
        command: command.to_owned(),
        ..FragmentMeta::default()
    };
    Fragment::new(meta, index, count, payload)
        .to_wire()
        .expect("fragment encodes")
}
