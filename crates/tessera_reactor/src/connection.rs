//! Connection manager: the single owner of the transport.
//!
//! Drives the connect/backoff state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Erroring -> Backoff -> Connecting   (transport failure, heartbeat timeout)
//! any -> NeedsReauth                               (server refused the credential)
//! any -> Closed                                    (explicit close)
//! ```
//!
//! The manager never sleeps. It records deadlines (backoff expiry, next
//! heartbeat ping, pong timeout) and acts on them when [`ConnectionManager::poll`]
//! is called with the current instant.

use crate::config::{ReactorConfig, RetryConfig};
use crate::reactor::Shared;
use crate::transport::{SessionId, Transport, TransportEvents};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tessera_protocol::ClientMessage;

/// Connectivity status reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No connection has been requested yet.
    Disconnected,
    /// A transport session is opening or the join handshake is in flight.
    Connecting,
    /// The server accepted the join; frames flow.
    Connected,
    /// The connection just failed.
    Erroring,
    /// Waiting before the next reconnect attempt (or for the network).
    Backoff,
    /// The server refused the credential; waiting for a new one.
    NeedsReauth,
    /// Closed by the application.
    Closed,
}

impl ConnectionStatus {
    /// Returns true if frames can flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Returns true if the reactor is trying to (re)connect on its own.
    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Erroring | ConnectionStatus::Backoff
        )
    }

    /// Returns the status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Erroring => "erroring",
            ConnectionStatus::Backoff => "backoff",
            ConnectionStatus::NeedsReauth => "needs-reauth",
            ConnectionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening(SessionId),
    Joining(SessionId),
    Joined(SessionId),
}

impl Phase {
    fn session(self) -> Option<SessionId> {
        match self {
            Phase::Idle => None,
            Phase::Opening(s) | Phase::Joining(s) | Phase::Joined(s) => Some(s),
        }
    }
}

/// Owns the transport and the connection state machine.
pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    events_target: Weak<Shared>,
    retry: RetryConfig,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Duration,
    status: ConnectionStatus,
    phase: Phase,
    next_session: u64,
    attempts: u32,
    backoff_until: Option<Instant>,
    next_ping: Option<Instant>,
    awaiting_pong: Option<(u64, Instant)>,
    next_nonce: u64,
    online: bool,
    changes: Vec<ConnectionStatus>,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: &ReactorConfig,
        events_target: Weak<Shared>,
    ) -> Self {
        Self {
            transport,
            events_target,
            retry: config.retry.clone(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            status: ConnectionStatus::Disconnected,
            phase: Phase::Idle,
            next_session: 1,
            attempts: 0,
            backoff_until: None,
            next_ping: None,
            awaiting_pong: None,
            next_nonce: 1,
            online: true,
            changes: Vec::new(),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Joined(_))
    }

    pub(crate) fn is_current(&self, session: SessionId) -> bool {
        self.phase.session() == Some(session)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Status transitions since the last call, oldest first.
    pub(crate) fn take_changes(&mut self) -> Vec<ConnectionStatus> {
        std::mem::take(&mut self.changes)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::debug!(from = %self.status, to = %status, "[connection] status");
            self.status = status;
            self.changes.push(status);
        }
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.phase.session() {
            self.transport.disconnect(session);
        }
        self.phase = Phase::Idle;
        self.next_ping = None;
        self.awaiting_pong = None;
    }

    fn begin_attempt(&mut self) {
        self.backoff_until = None;
        if !self.online {
            tracing::debug!("[connection] offline, waiting for the network");
            self.set_status(ConnectionStatus::Backoff);
            return;
        }

        let session = SessionId(self.next_session);
        self.next_session += 1;
        self.phase = Phase::Opening(session);
        self.set_status(ConnectionStatus::Connecting);
        tracing::debug!(%session, attempt = self.attempts, "[connection] opening session");
        self.transport
            .connect(session, TransportEvents::new(session, self.events_target.clone()));
    }

    /// Starts connecting if nothing has been attempted yet.
    pub(crate) fn ensure_started(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            self.begin_attempt();
        }
    }

    /// Explicit connect. Re-opens after `close`, skips any remaining backoff
    /// and retries after a credential refusal.
    pub(crate) fn connect(&mut self) {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {}
            ConnectionStatus::Disconnected
            | ConnectionStatus::Erroring
            | ConnectionStatus::Backoff
            | ConnectionStatus::NeedsReauth
            | ConnectionStatus::Closed => self.begin_attempt(),
        }
    }

    /// The transport finished opening. Returns true if the join should be sent.
    pub(crate) fn on_opened(&mut self, session: SessionId) -> bool {
        if self.phase == Phase::Opening(session) {
            self.phase = Phase::Joining(session);
            true
        } else {
            false
        }
    }

    /// The server accepted the join. Returns true if this completes a connect.
    pub(crate) fn on_joined(&mut self, session: SessionId, now: Instant) -> bool {
        if self.phase != Phase::Joining(session) {
            return false;
        }
        self.phase = Phase::Joined(session);
        self.attempts = 0;
        self.awaiting_pong = None;
        self.next_ping = self.heartbeat_interval.map(|interval| now + interval);
        self.set_status(ConnectionStatus::Connected);
        tracing::info!(%session, "[connection] connected");
        true
    }

    /// The current session failed. Schedules a retry.
    pub(crate) fn fail(&mut self, now: Instant, reason: &str) {
        if self.phase == Phase::Idle {
            return;
        }
        self.drop_session();
        self.set_status(ConnectionStatus::Erroring);

        self.attempts = self.attempts.saturating_add(1);
        let delay = self.retry.delay_for_attempt(self.attempts);
        self.backoff_until = self.online.then_some(now + delay);
        tracing::warn!(
            reason,
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "[connection] connection lost, backing off"
        );
        self.set_status(ConnectionStatus::Backoff);
    }

    /// A session ended. Returns false if it was not the current session.
    pub(crate) fn on_closed(&mut self, session: SessionId, reason: &str, now: Instant) -> bool {
        if !self.is_current(session) {
            tracing::debug!(%session, reason, "[connection] ignoring close of stale session");
            return false;
        }
        self.fail(now, reason);
        true
    }

    /// The server refused the credential. No retry until [`Self::connect`].
    pub(crate) fn require_reauth(&mut self, reason: &str) {
        self.drop_session();
        self.backoff_until = None;
        tracing::warn!(reason, "[connection] credential refused");
        self.set_status(ConnectionStatus::NeedsReauth);
    }

    /// Terminal until the next explicit connect.
    pub(crate) fn close(&mut self) {
        self.drop_session();
        self.backoff_until = None;
        self.set_status(ConnectionStatus::Closed);
    }

    /// Sends a message on the open session. A retryable transport error
    /// fails the connection; any other error drops only this frame. Returns
    /// true if the frame was handed to the transport.
    pub(crate) fn send(&mut self, message: &ClientMessage, now: Instant) -> bool {
        let session = match self.phase {
            Phase::Joining(s) | Phase::Joined(s) => s,
            Phase::Idle | Phase::Opening(_) => return false,
        };
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = message.kind(), error = %e, "[connection] failed to encode");
                return false;
            }
        };
        match self.transport.send(session, frame) {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                self.fail(now, &e.to_string());
                false
            }
            Err(e) => {
                tracing::error!(kind = message.kind(), error = %e, "[connection] transport refused frame");
                false
            }
        }
    }

    /// Acts on every deadline that has passed.
    pub(crate) fn poll(&mut self, now: Instant) {
        if self.status == ConnectionStatus::Backoff {
            if let Some(until) = self.backoff_until {
                if until <= now {
                    self.begin_attempt();
                }
            }
            return;
        }

        if !self.is_connected() {
            return;
        }
        if let Some((_, deadline)) = self.awaiting_pong {
            if deadline <= now {
                self.fail(now, "heartbeat timeout");
            }
            return;
        }
        if let (Some(at), Some(interval)) = (self.next_ping, self.heartbeat_interval) {
            if at <= now {
                let nonce = self.next_nonce;
                self.next_nonce += 1;
                self.next_ping = Some(now + interval);
                if self.send(&ClientMessage::Ping { nonce }, now) {
                    self.awaiting_pong = Some((nonce, now + self.heartbeat_timeout));
                }
            }
        }
    }

    pub(crate) fn on_pong(&mut self, nonce: u64) {
        if matches!(self.awaiting_pong, Some((expected, _)) if expected == nonce) {
            self.awaiting_pong = None;
        }
    }

    /// Earliest instant at which [`Self::poll`] has work to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if self.status == ConnectionStatus::Backoff {
            return self.backoff_until;
        }
        if !self.is_connected() {
            return None;
        }
        match self.awaiting_pong {
            Some((_, deadline)) => Some(deadline),
            None => self.next_ping,
        }
    }

    /// Network hint. Going offline parks the backoff timer; coming back
    /// online reconnects immediately.
    pub(crate) fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        tracing::info!(online, "[connection] network changed");
        if self.status != ConnectionStatus::Backoff {
            return;
        }
        if online {
            self.begin_attempt();
        } else {
            self.backoff_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReactorError, ReactorResult};
    use parking_lot::Mutex;
    use tessera_codec::CodecError;

    #[derive(Default)]
    struct Calls {
        connects: Vec<SessionId>,
        sends: Vec<(SessionId, ClientMessage)>,
        disconnects: Vec<SessionId>,
        fail_sends: bool,
        refuse_frames: bool,
    }

    #[derive(Default)]
    struct FakeTransport(Mutex<Calls>);

    impl Transport for FakeTransport {
        fn connect(&self, session: SessionId, _events: TransportEvents) {
            self.0.lock().connects.push(session);
        }

        fn send(&self, session: SessionId, frame: Vec<u8>) -> ReactorResult<()> {
            let mut calls = self.0.lock();
            if calls.fail_sends {
                return Err(ReactorError::transport("broken pipe"));
            }
            if calls.refuse_frames {
                return Err(ReactorError::Codec(CodecError::encoding_failed("frame too large")));
            }
            calls.sends.push((session, ClientMessage::decode(&frame)?));
            Ok(())
        }

        fn disconnect(&self, session: SessionId) {
            self.0.lock().disconnects.push(session);
        }
    }

    fn manager(config: ReactorConfig) -> (ConnectionManager, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let manager = ConnectionManager::new(transport.clone(), &config, Weak::new());
        (manager, transport)
    }

    fn quick_config() -> ReactorConfig {
        ReactorConfig::new("app", "mem://")
            .with_retry(
                RetryConfig::new(Duration::from_secs(1), Duration::from_secs(8)).with_jitter(false),
            )
            .with_heartbeat(Duration::from_secs(30), Duration::from_secs(5))
    }

    fn connect(manager: &mut ConnectionManager, now: Instant) -> SessionId {
        manager.connect();
        let session = SessionId(manager.next_session - 1);
        assert!(manager.on_opened(session));
        assert!(manager.on_joined(session, now));
        session
    }

    #[test]
    fn connects_only_after_join() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        m.ensure_started();
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        let session = transport.0.lock().connects[0];

        assert!(m.on_opened(session));
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert!(!m.is_connected());

        assert!(m.on_joined(session, now));
        assert_eq!(
            m.take_changes(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[test]
    fn backoff_grows_and_resets() {
        let (mut m, transport) = manager(quick_config());
        let t0 = Instant::now();
        let session = connect(&mut m, t0);

        assert!(m.on_closed(session, "reset by peer", t0));
        assert_eq!(m.status(), ConnectionStatus::Backoff);
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(1)));

        m.poll(t0 + Duration::from_millis(500));
        assert_eq!(m.status(), ConnectionStatus::Backoff);

        m.poll(t0 + Duration::from_secs(1));
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        let second = *transport.0.lock().connects.last().unwrap();
        m.on_closed(second, "refused", t0 + Duration::from_secs(1));
        assert_eq!(
            m.next_deadline(),
            Some(t0 + Duration::from_secs(1) + Duration::from_secs(2))
        );

        m.connect();
        let third = *transport.0.lock().connects.last().unwrap();
        m.on_opened(third);
        m.on_joined(third, t0);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let (mut m, _transport) = manager(quick_config());
        let now = Instant::now();
        let first = connect(&mut m, now);
        m.on_closed(first, "dropped", now);
        m.connect();
        let second = SessionId(m.next_session - 1);

        assert!(!m.on_closed(first, "late close", now));
        assert!(!m.on_opened(first));
        assert!(m.on_opened(second));
        assert_eq!(m.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn heartbeat_timeout_fails_connection() {
        let (mut m, transport) = manager(quick_config());
        let t0 = Instant::now();
        connect(&mut m, t0);

        m.poll(t0 + Duration::from_secs(30));
        let nonce = match &transport.0.lock().sends.last().unwrap().1 {
            ClientMessage::Ping { nonce } => *nonce,
            other => panic!("expected ping, got {other:?}"),
        };
        m.on_pong(nonce);
        assert_eq!(m.next_deadline(), Some(t0 + Duration::from_secs(60)));

        m.poll(t0 + Duration::from_secs(60));
        m.poll(t0 + Duration::from_secs(65));
        assert_eq!(m.status(), ConnectionStatus::Backoff);
        assert_eq!(transport.0.lock().disconnects.len(), 1);
    }

    #[test]
    fn send_failure_fails_connection() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        connect(&mut m, now);
        transport.0.lock().fail_sends = true;

        assert!(!m.send(&ClientMessage::Ping { nonce: 9 }, now));
        assert_eq!(m.status(), ConnectionStatus::Backoff);
    }

    #[test]
    fn refused_frame_keeps_connection() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        connect(&mut m, now);
        transport.0.lock().refuse_frames = true;

        assert!(!m.send(&ClientMessage::Ping { nonce: 9 }, now));
        assert_eq!(m.status(), ConnectionStatus::Connected);
        assert!(transport.0.lock().disconnects.is_empty());
    }

    #[test]
    fn offline_parks_backoff_and_online_short_circuits() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        let session = connect(&mut m, now);
        m.set_online(false);
        m.on_closed(session, "network down", now);
        assert_eq!(m.status(), ConnectionStatus::Backoff);
        assert_eq!(m.next_deadline(), None);

        m.poll(now + Duration::from_secs(600));
        assert_eq!(transport.0.lock().connects.len(), 1);

        m.set_online(true);
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert_eq!(transport.0.lock().connects.len(), 2);
    }

    #[test]
    fn reauth_waits_for_explicit_connect() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        connect(&mut m, now);
        m.require_reauth("token expired");
        assert_eq!(m.status(), ConnectionStatus::NeedsReauth);
        assert_eq!(m.next_deadline(), None);

        m.poll(now + Duration::from_secs(3600));
        assert_eq!(transport.0.lock().connects.len(), 1);

        m.connect();
        assert_eq!(m.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn close_is_terminal_until_connect() {
        let (mut m, transport) = manager(quick_config());
        let now = Instant::now();
        connect(&mut m, now);
        m.close();
        assert_eq!(m.status(), ConnectionStatus::Closed);
        m.ensure_started();
        assert_eq!(m.status(), ConnectionStatus::Closed);
        assert_eq!(transport.0.lock().connects.len(), 1);

        m.connect();
        assert_eq!(m.status(), ConnectionStatus::Connecting);
    }
}
