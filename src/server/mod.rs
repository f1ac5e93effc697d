//! Tokio TCP front end for the gateway.
//!
//! [`Gateway`] accepts connections, builds one [`Session`] per connection on
//! top of a [`LineTransport`], registers it in a shared [`SessionRegistry`]
//! and serves it on a tracked task. Shutdown stops the accept loop, closes
//! every live session and waits for the connection tasks to finish.

mod backoff;
mod transport;

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
pub use backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    signal,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};
pub use transport::{LineTransport, MAX_LINE_LENGTH};

use crate::{
    broker::Broker,
    config::GatewayConfig,
    dispatch::{DispatchError, Dispatcher},
    message::LogicalMessage,
    session::{ClientInfo, PING_COMMAND, Session, SessionRegistry},
};

/// Accepts peer connections and runs their sessions.
pub struct Gateway {
    broker: Arc<dyn Broker>,
    dispatcher: Arc<dyn Dispatcher>,
    config: GatewayConfig,
    backoff: BackoffConfig,
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    /// Create a gateway sharing `broker` and `dispatcher` across sessions.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            broker,
            dispatcher,
            config: GatewayConfig::default(),
            backoff: BackoffConfig::default(),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Registry of sessions served by this gateway.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> { Arc::clone(&self.registry) }

    /// Serve `listener` until Ctrl+C is received.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's local address cannot be read.
    pub async fn run(self, listener: TcpListener) -> io::Result<()> {
        self.run_with_shutdown(listener, async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Serve `listener` until `shutdown` resolves.
    ///
    /// Accept failures are retried with exponential back-off and never
    /// surface as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's local address cannot be read.
    pub async fn run_with_shutdown<S>(self, listener: TcpListener, shutdown: S) -> io::Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        info!(addr = %listener.local_addr()?, "gateway listening");
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = self.accept_loop(listener, token.clone(), tracker.clone());

        select! {
            () = shutdown => token.cancel(),
            () = accept => {},
        }

        let closed = self.registry.close_all().await;
        tracker.close();
        tracker.wait().await;
        info!(closed, "gateway stopped");
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        token: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut delay = self.backoff.initial_delay;
        loop {
            let accepted = select! {
                biased;
                () = token.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    delay = self.backoff.initial_delay;
                    let session = self.open_session(stream, remote_addr, &tracker);
                    info!(connection = %session.id(), %remote_addr, "connection accepted");
                }
                Err(err) => {
                    warn!(error = %err, ?delay, "accept failed; backing off");
                    select! {
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(delay) => {},
                    }
                    delay = self.backoff.next_delay(delay);
                }
            }
        }
    }

    fn open_session(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        tracker: &TaskTracker,
    ) -> Arc<Session> {
        let (transport, inbound) = LineTransport::split(stream);
        let session = Session::builder(
            Arc::new(transport),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.broker),
        )
        .config(self.config)
        .client_info(ClientInfo {
            remote_addr: Some(remote_addr),
            ..ClientInfo::default()
        })
        .build();
        self.registry.insert(&session);

        let registry = Arc::clone(&self.registry);
        let served = Arc::clone(&session);
        tracker.spawn(async move {
            let id = served.id();
            served.serve(inbound).await;
            registry.remove(&id);
        });
        session
    }
}

/// Command asking the gateway to start consuming from a queue.
pub const REGISTER_QUEUE_COMMAND: &str = "registerqueue";
/// Command asking the gateway to stop consuming from a queue.
pub const CLOSE_QUEUE_COMMAND: &str = "closequeue";

/// Body of queue commands and of their replies.
///
/// An empty `queuename` in `registerqueue` requests an anonymous queue; the
/// reply carries the effective name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCommand {
    #[serde(rename = "queuename", default)]
    pub queue_name: String,
    #[serde(rename = "autodelete", default)]
    pub auto_delete: bool,
}

/// Dispatcher managing queue consumers and echoing everything else.
///
/// `registerqueue` and `closequeue` act on the session's consumers; `ping`
/// probes are absorbed without a reply; any other request is answered with
/// its own payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn process(
        &self,
        message: LogicalMessage,
        session: Arc<Session>,
    ) -> Result<(), DispatchError> {
        let data = match message.command() {
            PING_COMMAND => return Ok(()),
            REGISTER_QUEUE_COMMAND => {
                let command = parse_queue_command(message.data())?;
                let queue_name = session
                    .create_consumer(&command.queue_name, command.auto_delete)
                    .await?;
                let auto_delete = session
                    .consumer(&queue_name)
                    .is_some_and(|registration| registration.auto_delete);
                serde_json::to_string(&QueueCommand {
                    queue_name,
                    auto_delete,
                })?
            }
            CLOSE_QUEUE_COMMAND => {
                let command = parse_queue_command(message.data())?;
                session.close_consumer(&command.queue_name).await?;
                serde_json::to_string(&command)?
            }
            _ => message.data().to_owned(),
        };
        session
            .send_reply(LogicalMessage::reply_to(&message, data))
            .await?;
        Ok(())
    }
}

fn parse_queue_command(data: &str) -> Result<QueueCommand, DispatchError> {
    if data.trim().is_empty() {
        return Ok(QueueCommand::default());
    }
    Ok(serde_json::from_str(data)?)
}
