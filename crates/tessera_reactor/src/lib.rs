//! # Tessera Reactor
//!
//! Client-side sync reactor for Tessera.
//!
//! A [`Reactor`] keeps one multiplexed connection to a sync server and turns
//! it into live query results:
//! - Query subscriptions, deduplicated by content-addressed id
//! - Optimistic transactions with ordered server settlement
//! - Reconnect with backoff, replaying subscriptions then pending writes
//! - Durable device id, credential, pending queue and query cache
//! - Rooms with presence and topic broadcast
//!
//! ## Architecture
//!
//! ```text
//! application --subscribe/transact--> Reactor --frames--> Transport
//!                                        |
//!          +-----------------+-----------+------------+
//!          |                 |                        |
//!   ConnectionManager  SubscriptionRegistry     MutationQueue
//!                            |                        |
//!                            +------ materialize -----+
//! ```
//!
//! Every API call, inbound frame and timer tick is one state transition
//! against a single locked core. Subscriber callbacks run after the
//! transition, in order, without the lock held.
//!
//! ## Key Invariants
//!
//! - Settlements resolve in issuance order
//! - Structurally equal queries share one wire subscription
//! - On every connect, all subscriptions are replayed before any pending
//!   transaction, and rooms come last, each in creation order
//! - A delivered result is always snapshot plus pending writes, nothing else
//!
//! The reactor never sleeps on its own. Call [`Reactor::spawn_timer_driver`]
//! inside a tokio runtime, or drive deadlines manually with
//! [`Reactor::poll_timers`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod listeners;
mod mutation;
mod network;
mod persist;
mod reactor;
mod registry;
mod rooms;
pub mod store;
mod transport;
mod websocket;

pub use config::{ReactorConfig, RetryConfig};
pub use connection::ConnectionStatus;
pub use error::{ReactorError, ReactorResult};
pub use mutation::{MutationAck, MutationError, Settlement};
pub use network::{CredentialProvider, NetworkHints, NetworkListener, StaticCredentials};
pub use persist::Credential;
pub use reactor::{Reactor, ReactorBuilder, Unsubscribe};
pub use rooms::{Presence, TopicMessage};
pub use store::{PatchOutcome, ServerSnapshot};
pub use transport::{SessionId, Transport, TransportEvent, TransportEvents};
pub use websocket::WebSocketTransport;

pub use tessera_codec::Value;
pub use tessera_protocol::{
    Attributes, ClientMessage, Dataset, EntityKey, EntityUpsert, ErrorCode, Operation, PatchBody,
    Query, RejectReason, ServerMessage, SubscriptionId, PROTOCOL_VERSION,
};
