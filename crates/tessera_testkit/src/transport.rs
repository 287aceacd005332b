//! Scripted in-process transport.
//!
//! [`RecordingTransport`] never touches the network. It records every frame
//! the reactor sends, decoded as a [`ClientMessage`], and lets the test play
//! the server by delivering events on the most recent session.

use parking_lot::Mutex;
use std::sync::Arc;
use tessera_protocol::{ClientMessage, ServerMessage, SubscriptionId};
use tessera_reactor::{ReactorError, ReactorResult, SessionId, Transport, TransportEvents};

#[derive(Default)]
struct State {
    sessions: Vec<TransportEvents>,
    sent: Vec<(SessionId, ClientMessage)>,
    disconnected: Vec<SessionId>,
    fail_sends: bool,
}

/// Server session id assigned by [`RecordingTransport::accept_join`].
pub const TEST_SESSION: &str = "test-session";

/// A transport driven entirely by test code.
#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<State>,
}

impl RecordingTransport {
    /// Creates a new transport.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sessions the reactor has opened.
    pub fn connect_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// The most recent session, if any.
    pub fn current_session(&self) -> Option<SessionId> {
        self.state.lock().sessions.last().map(TransportEvents::session)
    }

    /// Event handle of a specific session.
    pub fn events_for(&self, session: SessionId) -> Option<TransportEvents> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|e| e.session() == session)
            .cloned()
    }

    fn latest(&self) -> TransportEvents {
        self.state
            .lock()
            .sessions
            .last()
            .cloned()
            .expect("the reactor has not opened a session")
    }

    /// Reports the latest session as open. The reactor answers with `join`.
    pub fn open(&self) {
        self.latest().opened();
    }

    /// Accepts the join on the latest session.
    pub fn accept_join(&self) {
        self.push(&ServerMessage::JoinOk {
            session_id: TEST_SESSION.into(),
        });
    }

    /// Opens the latest session and accepts its join.
    pub fn connect_and_join(&self) {
        self.open();
        self.accept_join();
    }

    /// Delivers a server message on the latest session.
    pub fn push(&self, message: &ServerMessage) {
        let frame = message.encode().expect("server message encodes");
        self.latest().frame(frame);
    }

    /// Delivers raw bytes on the latest session.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.latest().frame(bytes);
    }

    /// Ends the latest session as if the network dropped it.
    pub fn drop_connection(&self, reason: &str) {
        self.latest().closed(reason);
    }

    /// Makes every subsequent send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Every message sent so far, oldest first.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Removes and returns every message sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.drain(..).map(|(_, m)| m).collect()
    }

    /// Wire names of every message sent so far.
    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.state.lock().sent.iter().map(|(_, m)| m.kind()).collect()
    }

    /// Messages sent on one session.
    pub fn sent_on(&self, session: SessionId) -> Vec<ClientMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(s, _)| *s == session)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Subscription ids of every `add-query` sent so far.
    pub fn added_queries(&self) -> Vec<SubscriptionId> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::AddQuery { subscription_id, .. } => Some(subscription_id),
                _ => None,
            })
            .collect()
    }

    /// Sequence numbers of every `transact` sent so far.
    pub fn transacted(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Transact { seq, .. } => Some(seq),
                _ => None,
            })
            .collect()
    }

    /// Sessions the reactor has released.
    pub fn disconnected(&self) -> Vec<SessionId> {
        self.state.lock().disconnected.clone()
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, _session: SessionId, events: TransportEvents) {
        self.state.lock().sessions.push(events);
    }

    fn send(&self, session: SessionId, frame: Vec<u8>) -> ReactorResult<()> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(ReactorError::transport("send refused by test"));
        }
        let message = ClientMessage::decode(&frame)?;
        state.sent.push((session, message));
        Ok(())
    }

    fn disconnect(&self, session: SessionId) {
        self.state.lock().disconnected.push(session);
    }
}
