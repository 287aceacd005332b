//! # Tessera Storage
//!
//! Persistence adapters for the Tessera sync reactor.
//!
//! The reactor keeps a small amount of state across restarts (device id,
//! credential, pending mutations, cached query results). It reaches that
//! state only through the [`PersistenceAdapter`] trait, so embedders can
//! supply whatever durable key/value facility their platform offers.
//!
//! Two adapters ship with the crate:
//! - [`InMemoryStore`] - Ephemeral, for tests
//! - [`FileStore`] - One file per key under a locked directory

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
mod file;
mod memory;

pub use adapter::PersistenceAdapter;
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
