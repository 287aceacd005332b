//! Error types for the sync reactor.

use tessera_codec::CodecError;
use tessera_protocol::RejectReason;
use tessera_storage::StorageError;
use thiserror::Error;

/// Result type for reactor operations.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Errors that can occur in the sync reactor.
///
/// Network and protocol failures are absorbed by the reactor and surface as
/// connection status changes. The variants that reach callers are local
/// misuse (returned synchronously) and mutation outcomes (returned through a
/// [`crate::Settlement`]).
#[derive(Error, Debug)]
pub enum ReactorError {
    /// A transport could not carry a frame. Reported by [`crate::Transport`]
    /// implementations; the reactor answers with a reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected a transaction.
    #[error("transaction {seq} rejected: {} ({})", reason.message, reason.code)]
    Rejected {
        /// Local sequence number of the transaction.
        seq: u64,
        /// Reason reported by the server.
        reason: RejectReason,
    },

    /// The query shape is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The transaction is malformed.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A room id or topic is empty, or presence data is not a map.
    #[error("invalid room request: {0}")]
    InvalidRoom(String),

    /// Configuration is incomplete or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The reactor was shut down.
    #[error("reactor has been shut down")]
    Shutdown,

    /// The operation needs a joined connection and there is none.
    #[error("not connected to server")]
    NotConnected,
}

impl ReactorError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns true if the same call may succeed later without changes,
    /// e.g. once the connection is back.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReactorError::Transport(_) | ReactorError::NotConnected)
    }

    /// Returns the server's reason if this is a rejection.
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            ReactorError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
