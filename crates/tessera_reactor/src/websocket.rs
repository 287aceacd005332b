//! WebSocket transport using tokio-tungstenite.
//!
//! Each session runs one task on the tokio runtime that was current when the
//! transport was created. The task owns the socket: it forwards queued
//! outbound frames as binary messages and reports inbound binary or text
//! messages as frames.

use crate::error::{ReactorError, ReactorResult};
use crate::transport::{SessionId, Transport, TransportEvents};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct Session {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// A [`Transport`] over a WebSocket connection.
pub struct WebSocketTransport {
    url: String,
    runtime: Handle,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl WebSocketTransport {
    /// Creates a transport for `url` bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Config`] if called outside a tokio runtime.
    pub fn new(url: impl Into<String>) -> ReactorResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ReactorError::Config(format!("websocket transport needs a tokio runtime: {e}")))?;
        Ok(Self::with_runtime(url, runtime))
    }

    /// Creates a transport for `url` that spawns its tasks on `runtime`.
    pub fn with_runtime(url: impl Into<String>, runtime: Handle) -> Self {
        Self {
            url: url.into(),
            runtime,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, session: SessionId, events: TransportEvents) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(run_session(self.url.clone(), events, rx));
        if let Some(previous) = self
            .sessions
            .lock()
            .insert(session, Session { outbound, task })
        {
            previous.task.abort();
        }
    }

    fn send(&self, session: SessionId, frame: Vec<u8>) -> ReactorResult<()> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(&session)
            .ok_or_else(|| ReactorError::transport(format!("session {session} is not open")))?;
        entry
            .outbound
            .send(frame)
            .map_err(|_| ReactorError::transport(format!("session {session} has ended")))
    }

    fn disconnect(&self, session: SessionId) {
        if let Some(entry) = self.sessions.lock().remove(&session) {
            entry.task.abort();
            tracing::debug!(%session, "[websocket] session released");
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for (_, entry) in self.sessions.lock().drain() {
            entry.task.abort();
        }
    }
}

async fn run_session(url: String, events: TransportEvents, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    let session = events.session();
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::debug!(%session, error = %e, "[websocket] connect failed");
            events.closed(e.to_string());
            return;
        }
    };
    tracing::debug!(%session, url = %url, "[websocket] open");
    events.opened();

    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return;
                };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    break format!("send failed: {e}");
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Binary(bytes))) => events.frame(bytes),
                Some(Ok(Message::Text(text))) => events.frame(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(|| "closed by server".to_string(), |f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };
    tracing::debug!(%session, reason = %reason, "[websocket] closed");
    events.closed(reason);
}
