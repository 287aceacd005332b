//! Persistence adapter trait definition.

use crate::error::StorageResult;

/// A durable key/value capability supplied by the embedding platform.
///
/// The reactor uses it to keep the device id, the last credential, the
/// pending mutation queue and the query cache across process restarts.
/// Values are opaque bytes; the reactor owns their encoding.
///
/// # Invariants
///
/// - `get_item` returns exactly the bytes of the last successful `set_item`
///   for that key
/// - Writes to the same key are last-write-wins
/// - Adapters must be `Send + Sync`; the reactor never issues concurrent
///   writes to the same key
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For tests and ephemeral clients
/// - [`super::FileStore`] - One file per key in a locked directory
pub trait PersistenceAdapter: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be read.
    fn get_item(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be made durable.
    fn set_item(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn remove_item(&self, key: &str) -> StorageResult<()>;
}
