//! # Tessera Protocol
//!
//! Wire types for the Tessera sync reactor.
//!
//! This crate provides:
//! - [`ClientMessage`] and [`ServerMessage`] (join, add-query, remove-query,
//!   transact, patch, ack, reject, refresh, error, ping/pong, and the room
//!   messages for presence and broadcast)
//! - [`Operation`] for transaction steps
//! - [`Query`] shapes and their content-addressed [`SubscriptionId`]
//! - [`Dataset`] for entity data grouped by namespace
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dataset;
mod messages;
mod operation;
mod query;

pub use dataset::{Attributes, Dataset, EntityKey};
pub use messages::{
    ClientMessage, EntityUpsert, ErrorCode, PatchBody, RejectReason, ServerMessage,
    PROTOCOL_VERSION,
};
pub use operation::Operation;
pub use query::{NamespaceFilter, Query, SubscriptionId};
