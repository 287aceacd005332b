//! Transport layer abstraction.

use crate::error::ReactorResult;
use crate::reactor::Shared;
use std::fmt;
use std::sync::Weak;

/// Identifies one transport session.
///
/// Every connect attempt gets a fresh id. Events tagged with a superseded id
/// are ignored, so a late close from an old socket cannot tear down its
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    /// Returns the raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A bidirectional frame transport owned by the connection manager.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, in-process loopback, recording mock for tests).
///
/// Implementations report progress through the [`TransportEvents`] handed to
/// [`Transport::connect`]. They must not invoke those events from inside
/// `connect`, `send` or `disconnect`; events are delivered later, from an I/O
/// task or from test code.
pub trait Transport: Send + Sync {
    /// Starts opening a session. Completion is reported via `events`.
    fn connect(&self, session: SessionId, events: TransportEvents);

    /// Sends one frame on an open session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not open or the frame could not be
    /// queued. The reactor treats this as a connection failure.
    fn send(&self, session: SessionId, frame: Vec<u8>) -> ReactorResult<()>;

    /// Tears a session down. Must be idempotent and must not report `closed`.
    fn disconnect(&self, session: SessionId);
}

/// Something that happened on a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is open and can carry frames.
    Opened,
    /// A frame arrived.
    Frame(Vec<u8>),
    /// The session ended.
    Closed(String),
}

/// Callback handle a transport uses to report events for one session.
///
/// Holds only a weak reference to the reactor; events reported after the
/// reactor is dropped are discarded.
#[derive(Clone)]
pub struct TransportEvents {
    session: SessionId,
    shared: Weak<Shared>,
}

impl TransportEvents {
    pub(crate) fn new(session: SessionId, shared: Weak<Shared>) -> Self {
        Self { session, shared }
    }

    /// Returns the session these events belong to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Reports that the session is open.
    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    /// Reports an inbound frame.
    pub fn frame(&self, bytes: Vec<u8>) {
        self.emit(TransportEvent::Frame(bytes));
    }

    /// Reports that the session ended.
    pub fn closed(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed(reason.into()));
    }

    /// Reports an arbitrary event.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_transport_event(self.session, event);
        }
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
