#![doc(html_root_url = "https://docs.rs/wiregate/latest")]
//! Public API for the `wiregate` library.
//!
//! `wiregate` sits between a connected peer and business logic. Outbound
//! messages are split into size-bounded fragments and written FIFO; inbound
//! fragments are reassembled per identity under a memory ceiling. Requests
//! await replies through a per-session correlation table, and broker queue
//! deliveries are acknowledged or requeued after a delay depending on how
//! business handling went.

pub mod broker;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod fragment;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod session;

pub use broker::{Broker, MemoryBroker};
pub use config::{ConfigError, GatewayConfig};
pub use correlation::{CorrelationTable, PendingReply, RequestError};
pub use dispatch::{DeliveryHandler, DispatchError, Dispatcher};
pub use fragment::{
    Fragment,
    FragmentBatch,
    FragmentationError,
    Fragmenter,
    FrameError,
    MessageId,
    ReassemblyBuffer,
    ReassemblyError,
};
pub use message::LogicalMessage;
pub use metrics::Direction;
pub use queue::{ConsumerError, QueueBridge};
pub use scheduler::Scheduler;
pub use server::{EchoDispatcher, Gateway};
pub use session::{
    ClientInfo,
    ConnectionId,
    Inbound,
    InboundError,
    Session,
    SessionRegistry,
    Transport,
};
