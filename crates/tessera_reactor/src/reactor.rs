//! The reactor facade.
//!
//! [`Reactor`] composes the connection manager, subscription registry,
//! mutation queue and local store behind one handle. All state lives in a
//! single `Core` behind one lock; every public call, inbound transport event
//! and timer tick runs to completion against it before any subscriber
//! callback runs. Callbacks are queued during the transition and dispatched
//! afterwards, in order, with the lock released, so they may call back into
//! the reactor.

use crate::config::ReactorConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::{ReactorError, ReactorResult};
use crate::listeners::{Callback, Delivery, ListenerSet, Outbox};
use crate::mutation::{MutationError, MutationQueue, MutationStatus, Recorded, Settlement};
use crate::network::{CredentialProvider, NetworkHints, NetworkListener};
use crate::persist::{Credential, Persistence, QueryCache};
use crate::registry::{Removal, Scope, SubscriptionRegistry};
use crate::rooms::{Departure, Presence, RoomRegistry, TopicMessage};
use crate::store::PatchOutcome;
use crate::transport::{SessionId, Transport, TransportEvent};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tessera_codec::Value;
use tessera_protocol::{
    ClientMessage, Dataset, ErrorCode, Operation, PatchBody, Query, RejectReason, ServerMessage,
    SubscriptionId,
};
use tessera_storage::{InMemoryStore, PersistenceAdapter};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Reactor state. Mutated only while `Shared::core` is locked.
pub(crate) struct Core {
    config: ReactorConfig,
    device_id: String,
    credential: Option<Credential>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    rooms: RoomRegistry,
    server_session: Option<String>,
    queue: MutationQueue,
    persistence: Persistence,
    query_cache: QueryCache,
    status_listeners: ListenerSet<ConnectionStatus>,
    mutation_error_listeners: ListenerSet<MutationError>,
    status_tx: watch::Sender<ConnectionStatus>,
    outbox: Outbox,
    shut_down: bool,
}

impl Core {
    fn check_alive(&self) -> ReactorResult<()> {
        if self.shut_down {
            Err(ReactorError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn emit_status_changes(&mut self) {
        for status in self.connection.take_changes() {
            self.status_tx.send_replace(status);
            self.status_listeners
                .notify_all(&Arc::new(status), &mut self.outbox);
        }
    }

    fn persist_queue(&self) {
        self.persistence.save_queue(&self.queue.to_persisted());
    }

    /// Sends on a joined session. Returns false if the frame was not sent.
    fn send(&mut self, message: ClientMessage, now: Instant) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        self.connection.send(&message, now)
    }

    fn send_add_query(&mut self, id: &SubscriptionId, now: Instant) -> bool {
        let Some(subscription) = self.registry.get(id) else {
            return false;
        };
        let message = ClientMessage::AddQuery {
            subscription_id: id.clone(),
            query: subscription.query().shape().clone(),
        };
        self.send(message, now)
    }

    fn current_token(&self) -> Option<String> {
        match &self.credential {
            Some(credential) if credential.valid => Some(credential.token.clone()),
            _ => self.credentials.as_ref().and_then(|p| p.current_token()),
        }
    }

    // Application calls.

    fn subscribe(
        &mut self,
        query: Query,
        callback: Callback<Dataset>,
        now: Instant,
    ) -> ReactorResult<(SubscriptionId, u64, Arc<AtomicBool>)> {
        self.check_alive()?;
        let cached = self.query_cache.get(query.id()).cloned();
        let registration = self.registry.add(query, callback, cached);
        let id = registration.id;

        if registration.created {
            tracing::debug!(subscription = %id, "[registry] subscription created");
            self.send_add_query(&id, now);
            self.connection.ensure_started();
            self.registry
                .recompute(&Scope::One(id.clone()), &self.queue, &mut self.outbox);
        } else {
            self.registry
                .deliver_current(&id, registration.listener, &mut self.outbox);
        }
        Ok((id, registration.listener, registration.active))
    }

    fn unsubscribe_query(&mut self, id: &SubscriptionId, listener: u64, now: Instant) {
        match self.registry.remove(id, listener) {
            Removal::Last => {
                tracing::debug!(subscription = %id, "[registry] subscription removed");
                self.send(
                    ClientMessage::RemoveQuery {
                        subscription_id: id.clone(),
                    },
                    now,
                );
            }
            Removal::Remaining(count) => {
                tracing::trace!(subscription = %id, count, "[registry] listener removed");
            }
            Removal::NotFound => {}
        }
    }

    fn subscribe_presence(
        &mut self,
        room_id: &str,
        callback: Callback<Presence>,
        now: Instant,
    ) -> ReactorResult<(u64, Arc<AtomicBool>)> {
        self.check_alive()?;
        check_room_id(room_id)?;
        let (listener, active, entered) =
            self.rooms.add_presence_listener(room_id, callback, &mut self.outbox);
        if entered {
            self.enter_room(room_id, now);
        }
        Ok((listener, active))
    }

    fn subscribe_topic(
        &mut self,
        room_id: &str,
        topic: &str,
        callback: Callback<TopicMessage>,
        now: Instant,
    ) -> ReactorResult<(u64, Arc<AtomicBool>)> {
        self.check_alive()?;
        check_room_id(room_id)?;
        check_topic(topic)?;
        let (listener, active, entered) = self.rooms.add_topic_listener(room_id, topic, callback);
        if entered {
            self.enter_room(room_id, now);
        }
        Ok((listener, active))
    }

    fn enter_room(&mut self, room_id: &str, now: Instant) {
        tracing::debug!(room = room_id, "[rooms] entered");
        self.send(
            ClientMessage::JoinRoom {
                room_id: room_id.to_string(),
            },
            now,
        );
        self.connection.ensure_started();
    }

    fn after_room_departure(&mut self, room_id: &str, departure: Departure, now: Instant) {
        if departure == Departure::Left {
            tracing::debug!(room = room_id, "[rooms] left");
            self.send(
                ClientMessage::LeaveRoom {
                    room_id: room_id.to_string(),
                },
                now,
            );
        }
    }

    fn unsubscribe_presence(&mut self, room_id: &str, listener: u64, now: Instant) {
        let departure = self.rooms.remove_presence_listener(room_id, listener);
        self.after_room_departure(room_id, departure, now);
    }

    fn unsubscribe_topic(&mut self, room_id: &str, topic: &str, listener: u64, now: Instant) {
        let departure = self.rooms.remove_topic_listener(room_id, topic, listener);
        self.after_room_departure(room_id, departure, now);
    }

    fn publish_presence(&mut self, room_id: &str, data: Value, now: Instant) -> ReactorResult<()> {
        self.check_alive()?;
        check_room_id(room_id)?;
        let Value::Map(data) = data else {
            return Err(ReactorError::InvalidRoom("presence must be a map".into()));
        };
        let Some(user) = self.rooms.set_user(room_id, &data, &mut self.outbox) else {
            return Err(ReactorError::InvalidRoom(format!(
                "room `{room_id}` has no subscribers"
            )));
        };
        self.send(
            ClientMessage::SetPresence {
                room_id: room_id.to_string(),
                data: user,
            },
            now,
        );
        Ok(())
    }

    fn publish_topic(
        &mut self,
        room_id: &str,
        topic: &str,
        data: Value,
        now: Instant,
    ) -> ReactorResult<()> {
        self.check_alive()?;
        check_room_id(room_id)?;
        check_topic(topic)?;
        if !self.connection.is_connected() {
            return Err(ReactorError::NotConnected);
        }
        let message = ClientMessage::ClientBroadcast {
            room_id: room_id.to_string(),
            topic: topic.to_string(),
            data,
        };
        if self.send(message, now) {
            Ok(())
        } else {
            Err(ReactorError::NotConnected)
        }
    }

    fn transact(&mut self, operations: Vec<Operation>, now: Instant) -> ReactorResult<Settlement> {
        self.check_alive()?;
        if operations.is_empty() {
            return Err(ReactorError::InvalidTransaction(
                "transaction has no operations".into(),
            ));
        }
        for op in &operations {
            op.validate()
                .map_err(|e| ReactorError::InvalidTransaction(e.to_string()))?;
        }

        let namespaces = namespaces_of(&operations);
        let settlement = self.queue.enqueue(operations.clone());
        let seq = settlement.seq();
        self.persist_queue();
        self.registry
            .recompute(&Scope::Namespaces(namespaces), &self.queue, &mut self.outbox);

        let sent = self.send(ClientMessage::Transact { seq, operations }, now);
        self.connection.ensure_started();
        tracing::debug!(seq, sent, "[queue] enqueued");
        Ok(settlement)
    }

    fn close(&mut self) {
        if self.shut_down {
            return;
        }
        self.connection.close();
        self.registry.mark_all_stale();
        self.rooms.mark_all_rejoining(&mut self.outbox);
        tracing::info!("[reactor] closed");
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.connection.close();
        self.emit_status_changes();
        self.registry.clear();
        self.rooms.clear();
        let failed = self.queue.fail_all();
        self.status_listeners.clear();
        self.mutation_error_listeners.clear();
        tracing::info!(failed_settlements = failed, "[reactor] shut down");
    }

    fn set_credential(&mut self, token: Option<String>) -> ReactorResult<()> {
        self.check_alive()?;
        self.credential = token.map(Credential::new);
        self.persistence.save_credential(self.credential.as_ref());
        if self.connection.status() == ConnectionStatus::NeedsReauth {
            self.connection.connect();
        }
        Ok(())
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        if !self.shut_down {
            self.connection.set_online(online);
        }
    }

    // Transport events.

    fn on_transport_event(&mut self, session: SessionId, event: TransportEvent, now: Instant) {
        if self.shut_down {
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.connection.on_opened(session) {
                    let join = ClientMessage::Join {
                        app_id: self.config.app_id.clone(),
                        device_id: self.device_id.clone(),
                        protocol_version: self.config.protocol_version,
                        token: self.current_token(),
                    };
                    self.connection.send(&join, now);
                }
            }
            TransportEvent::Frame(bytes) => {
                if !self.connection.is_current(session) {
                    tracing::debug!(%session, "[reactor] dropping frame from stale session");
                    return;
                }
                match ServerMessage::decode(&bytes) {
                    Ok(message) => self.on_message(session, message, now),
                    Err(e) => {
                        tracing::warn!(%session, error = %e, "[reactor] dropping undecodable frame");
                    }
                }
            }
            TransportEvent::Closed(reason) => {
                self.connection.on_closed(session, &reason, now);
            }
        }
    }

    fn on_message(&mut self, session: SessionId, message: ServerMessage, now: Instant) {
        tracing::trace!(kind = message.kind(), "[reactor] received");
        match message {
            ServerMessage::JoinOk { session_id } => {
                if self.connection.on_joined(session, now) {
                    tracing::debug!(server_session = %session_id, "[reactor] joined");
                    self.server_session = Some(session_id);
                    self.on_connected(now);
                }
            }
            ServerMessage::Patch {
                subscription_id,
                version,
                body,
            } => self.on_patch(subscription_id, version, &body),
            ServerMessage::Ack { seq } => self.on_outcome(seq, Ok(()), now),
            ServerMessage::Reject { seq, reason } => self.on_outcome(seq, Err(reason), now),
            ServerMessage::Refresh { token } => self.on_refresh(token),
            ServerMessage::Error {
                code,
                message,
                subscription_id,
            } => self.on_server_error(code, &message, subscription_id.as_ref()),
            ServerMessage::Pong { nonce } => self.connection.on_pong(nonce),
            ServerMessage::JoinRoomOk { room_id } => {
                if !self.rooms.on_joined(&room_id, &mut self.outbox) {
                    tracing::debug!(room = %room_id, "[rooms] join confirmed for unknown room");
                }
            }
            ServerMessage::JoinRoomError { room_id, message } => {
                tracing::warn!(room = %room_id, %message, "[rooms] join refused");
                self.rooms.on_join_error(&room_id, &message, &mut self.outbox);
            }
            ServerMessage::RefreshPresence { room_id, peers } => {
                let own = self.server_session.as_deref();
                if !self.rooms.on_presence(&room_id, peers, own, &mut self.outbox) {
                    tracing::debug!(room = %room_id, "[rooms] presence for unknown room");
                }
            }
            ServerMessage::ServerBroadcast {
                room_id,
                topic,
                peer_id,
                data,
            } => {
                let own = self.server_session.as_deref();
                self.rooms
                    .on_broadcast(&room_id, &topic, &peer_id, data, own, &mut self.outbox);
            }
        }
    }

    /// Replays every subscription, then every pending transaction, then every
    /// room, each in creation order.
    fn on_connected(&mut self, now: Instant) {
        let subscriptions: Vec<SubscriptionId> = self
            .registry
            .in_creation_order()
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        self.registry.mark_awaiting_full(&subscriptions);
        for id in &subscriptions {
            if !self.send_add_query(id, now) {
                return;
            }
        }

        let pending: Vec<(u64, Vec<Operation>)> = self
            .queue
            .iter()
            .filter(|m| *m.status() == MutationStatus::Pending)
            .map(|m| (m.seq(), m.operations().to_vec()))
            .collect();
        for (seq, operations) in &pending {
            let message = ClientMessage::Transact {
                seq: *seq,
                operations: operations.clone(),
            };
            if !self.send(message, now) {
                return;
            }
        }

        self.rooms.mark_all_rejoining(&mut self.outbox);
        let rooms = self.rooms.replay();
        for (room_id, _) in &rooms {
            let message = ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            };
            if !self.send(message, now) {
                return;
            }
        }
        for (room_id, user) in &rooms {
            let Some(user) = user else { continue };
            let message = ClientMessage::SetPresence {
                room_id: room_id.clone(),
                data: user.clone(),
            };
            if !self.send(message, now) {
                return;
            }
        }
        tracing::info!(
            subscriptions = subscriptions.len(),
            mutations = pending.len(),
            rooms = rooms.len(),
            "[reactor] replayed after connect"
        );
    }

    fn on_patch(&mut self, id: SubscriptionId, version: u64, body: &PatchBody) {
        match self.registry.apply_patch(&id, version, body) {
            None => tracing::debug!(subscription = %id, "[registry] patch for unknown subscription"),
            Some(PatchOutcome::Applied) => {
                let snapshot = self.registry.get(&id).and_then(|s| s.snapshot());
                if let Some(snapshot) = snapshot {
                    if self.query_cache.put(&id, snapshot) {
                        self.persistence.save_query_cache(&self.query_cache);
                    }
                }
                self.registry
                    .recompute(&Scope::One(id), &self.queue, &mut self.outbox);
            }
            Some(outcome) => {
                tracing::debug!(subscription = %id, version, ?outcome, "[registry] patch ignored");
            }
        }
    }

    fn on_outcome(&mut self, seq: u64, outcome: Result<(), RejectReason>, now: Instant) {
        match self.queue.record(seq, outcome) {
            Recorded::Stored => {}
            Recorded::Unknown => {
                tracing::warn!(seq, "[queue] outcome for unknown transaction");
                return;
            }
            Recorded::Duplicate => {
                tracing::debug!(seq, "[queue] duplicate outcome");
                return;
            }
        }

        let resolved = self.queue.drain_settled();
        if resolved.is_empty() {
            return;
        }
        self.persist_queue();

        let mut affected: BTreeSet<String> = BTreeSet::new();
        for mut entry in resolved {
            affected.extend(namespaces_of(&entry.operations));
            if let Err(reason) = &entry.outcome {
                let dependents = self.queue.dependent_namespaces(&entry.operations);
                let refetch = self.registry.touching(&dependents);
                self.registry.mark_awaiting_full(&refetch);
                for id in &refetch {
                    self.send_add_query(id, now);
                }
                tracing::warn!(
                    seq = entry.seq,
                    code = %reason.code,
                    refetch = refetch.len(),
                    "[queue] transaction rejected"
                );
                let error = Arc::new(MutationError {
                    seq: entry.seq,
                    reason: reason.clone(),
                    operations: entry.operations.clone(),
                });
                self.mutation_error_listeners
                    .notify_all(&error, &mut self.outbox);
                affected.extend(dependents);
            } else {
                tracing::debug!(seq = entry.seq, "[queue] transaction acknowledged");
            }
            if !entry.settle() {
                tracing::info!(seq = entry.seq, ok = entry.outcome.is_ok(), "[queue] settled with no waiter");
            }
        }
        self.registry
            .recompute(&Scope::Namespaces(affected), &self.queue, &mut self.outbox);
    }

    fn on_refresh(&mut self, token: String) {
        let credential = Credential::new(token);
        self.persistence.save_credential(Some(&credential));
        if let Some(provider) = self.credentials.clone() {
            let token = credential.token.clone();
            let notify: Delivery = Box::new(move || provider.on_refresh(&token));
            self.outbox.push(notify);
        }
        self.credential = Some(credential);
        tracing::info!("[reactor] credential refreshed");
    }

    fn on_server_error(&mut self, code: ErrorCode, message: &str, subscription: Option<&SubscriptionId>) {
        if code == ErrorCode::Unauthorized {
            if let Some(credential) = &mut self.credential {
                credential.valid = false;
            }
            self.persistence.save_credential(self.credential.as_ref());
            self.connection.require_reauth(message);
            return;
        }
        match subscription {
            Some(id) => tracing::warn!(?code, subscription = %id, message, "[reactor] server error"),
            None => tracing::warn!(?code, message, "[reactor] server error"),
        }
    }
}

fn check_room_id(room_id: &str) -> ReactorResult<()> {
    if room_id.is_empty() {
        Err(ReactorError::InvalidRoom("room id is empty".into()))
    } else {
        Ok(())
    }
}

fn check_topic(topic: &str) -> ReactorResult<()> {
    if topic.is_empty() {
        Err(ReactorError::InvalidRoom("topic is empty".into()))
    } else {
        Ok(())
    }
}

fn namespaces_of(operations: &[Operation]) -> BTreeSet<String> {
    operations
        .iter()
        .map(|op| op.namespace().to_string())
        .collect()
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Delivery>,
    running: bool,
}

/// Resets the dispatch flag if a callback panics.
struct DispatchGuard<'a>(&'a Mutex<Dispatch>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().running = false;
        }
    }
}

/// State shared between the facade, transport events and the timer driver.
pub(crate) struct Shared {
    core: Mutex<Core>,
    dispatch: Mutex<Dispatch>,
    timer: Arc<Notify>,
}

impl Shared {
    /// Runs one state transition, then dispatches the callbacks it queued.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, rescheduled) = {
            let mut core = self.core.lock();
            let before = core.connection.next_deadline();
            let result = f(&mut core);
            core.emit_status_changes();
            if !core.outbox.is_empty() {
                let deliveries = core.outbox.take();
                self.dispatch.lock().queue.extend(deliveries);
            }
            (result, core.connection.next_deadline() != before)
        };
        if rescheduled {
            self.timer.notify_one();
        }
        self.run_deliveries();
        result
    }

    fn run_deliveries(&self) {
        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.running {
                return;
            }
            dispatch.running = true;
        }
        let _guard = DispatchGuard(&self.dispatch);
        loop {
            let next = {
                let mut dispatch = self.dispatch.lock();
                match dispatch.queue.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        dispatch.running = false;
                        return;
                    }
                }
            };
            next();
        }
    }

    pub(crate) fn handle_transport_event(&self, session: SessionId, event: TransportEvent) {
        self.with_core(|core| core.on_transport_event(session, event, Instant::now()));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.timer.notify_one();
    }
}

/// Builds a [`Reactor`].
pub struct ReactorBuilder {
    config: ReactorConfig,
    transport: Arc<dyn Transport>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    network: Option<Arc<dyn NetworkListener>>,
}

impl ReactorBuilder {
    /// Sets the persistence adapter. Defaults to an in-memory store.
    pub fn with_persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    /// Sets the credential provider.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Sets the network listener.
    pub fn with_network_listener(mut self, listener: Arc<dyn NetworkListener>) -> Self {
        self.network = Some(listener);
        self
    }

    /// Loads persisted state and creates the reactor.
    ///
    /// No connection is opened unless restored transactions are waiting to
    /// be retransmitted; otherwise the first subscribe or transact connects.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Config`] for an unusable configuration, or a
    /// storage error if the device id cannot be read or stored.
    pub fn build(self) -> ReactorResult<Reactor> {
        self.config.validate()?;
        let adapter = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let persistence = Persistence::new(adapter);
        let device_id = persistence.load_or_create_device_id()?;
        let credential = persistence.load_credential();
        let queue = MutationQueue::restore(persistence.load_queue());
        let query_cache = persistence.load_query_cache(self.config.query_cache_limit);
        let restored = queue.len();
        tracing::debug!(
            device_id = %device_id,
            cached_queries = query_cache.len(),
            "[reactor] loaded persisted state"
        );

        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let config = self.config;
        let transport = self.transport;
        let credentials = self.credentials;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            core: Mutex::new(Core {
                connection: ConnectionManager::new(transport, &config, weak.clone()),
                config,
                device_id,
                credential,
                credentials,
                registry: SubscriptionRegistry::default(),
                rooms: RoomRegistry::default(),
                server_session: None,
                queue,
                persistence,
                query_cache,
                status_listeners: ListenerSet::default(),
                mutation_error_listeners: ListenerSet::default(),
                status_tx,
                outbox: Outbox::default(),
                shut_down: false,
            }),
            dispatch: Mutex::new(Dispatch::default()),
            timer: Arc::new(Notify::new()),
        });

        if let Some(network) = self.network {
            let online = network.is_online();
            shared.with_core(|core| core.set_online(online));
            network.watch(NetworkHints::new(Arc::downgrade(&shared)));
        }

        if restored > 0 {
            tracing::info!(count = restored, "[reactor] restored pending transactions");
            shared.with_core(|core| core.connection.ensure_started());
        }

        Ok(Reactor { shared })
    }
}

/// The public entry point of the sync reactor.
///
/// Cloning a `Reactor` yields another handle to the same instance. Separate
/// instances share nothing.
///
/// # Example
///
/// ```rust,ignore
/// use serde_json::json;
/// use tessera_reactor::{Reactor, ReactorConfig, WebSocketTransport};
///
/// let transport = Arc::new(WebSocketTransport::new("ws://localhost:8888/runtime")?);
/// let reactor = Reactor::builder(ReactorConfig::new("app", "ws://localhost:8888/runtime"), transport)
///     .build()?;
/// reactor.spawn_timer_driver();
///
/// let unsubscribe = reactor.subscribe_query(&json!({"todos": {}}).into(), |todos| {
///     println!("{} todos", todos.len());
/// })?;
/// ```
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    /// Starts building a reactor.
    pub fn builder(config: ReactorConfig, transport: Arc<dyn Transport>) -> ReactorBuilder {
        ReactorBuilder {
            config,
            transport,
            persistence: None,
            credentials: None,
            network: None,
        }
    }

    /// Registers interest in a query.
    ///
    /// The callback receives each distinct materialized result. If a result
    /// is already known (another listener on the same query, or the query
    /// cache) the first call happens before this method returns.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidQuery`] for a malformed shape and
    /// [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn subscribe_query<F>(&self, query: &Value, callback: F) -> ReactorResult<Unsubscribe>
    where
        F: Fn(&Dataset) + Send + Sync + 'static,
    {
        let query = Query::parse(query).map_err(|e| ReactorError::InvalidQuery(e.to_string()))?;
        let callback: Callback<Dataset> = Arc::new(callback);
        let (id, listener, active) = self
            .shared
            .with_core(|core| core.subscribe(query, callback, Instant::now()))?;
        Ok(self.handle(Target::Query { id, listener }, active))
    }

    /// Applies a transaction optimistically and sends it to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidTransaction`] for an empty transaction
    /// or an operation without a namespace or id, and
    /// [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn transact(&self, operations: Vec<Operation>) -> ReactorResult<Settlement> {
        self.shared
            .with_core(|core| core.transact(operations, Instant::now()))
    }

    /// Registers a callback for connection status changes. It is called with
    /// the current status first.
    pub fn subscribe_connection_status<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let callback: Callback<ConnectionStatus> = Arc::new(move |status| callback(*status));
        let (listener, active) = self.shared.with_core(|core| {
            let (listener, active) = core.status_listeners.add(callback);
            if core.shut_down {
                core.status_listeners.clear();
            } else {
                let current = Arc::new(core.connection.status());
                core.status_listeners
                    .notify_one(listener, &current, &mut core.outbox);
            }
            (listener, active)
        });
        self.handle(Target::Status(listener), active)
    }

    /// Registers a callback for every rejected transaction, including those
    /// restored from a previous run that no caller is awaiting.
    pub fn subscribe_mutation_errors<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&MutationError) + Send + Sync + 'static,
    {
        let callback: Callback<MutationError> = Arc::new(callback);
        let (listener, active) = self.shared.with_core(|core| {
            let registered = core.mutation_error_listeners.add(callback);
            if core.shut_down {
                core.mutation_error_listeners.clear();
            }
            registered
        });
        self.handle(Target::MutationErrors(listener), active)
    }

    /// Registers a callback for presence in a room, entering the room if
    /// this is its first listener. The callback is called with the current
    /// presence first, then with each distinct change.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidRoom`] for an empty room id and
    /// [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn subscribe_presence<F>(&self, room_id: &str, callback: F) -> ReactorResult<Unsubscribe>
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        let callback: Callback<Presence> = Arc::new(callback);
        let (listener, active) = self
            .shared
            .with_core(|core| core.subscribe_presence(room_id, callback, Instant::now()))?;
        let target = Target::Presence {
            room_id: room_id.to_string(),
            listener,
        };
        Ok(self.handle(target, active))
    }

    /// Registers a callback for messages published on a room topic,
    /// entering the room if this is its first listener.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidRoom`] for an empty room id or topic
    /// and [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn subscribe_topic<F>(
        &self,
        room_id: &str,
        topic: &str,
        callback: F,
    ) -> ReactorResult<Unsubscribe>
    where
        F: Fn(&TopicMessage) + Send + Sync + 'static,
    {
        let callback: Callback<TopicMessage> = Arc::new(callback);
        let (listener, active) = self.shared.with_core(|core| {
            core.subscribe_topic(room_id, topic, callback, Instant::now())
        })?;
        let target = Target::Topic {
            room_id: room_id.to_string(),
            topic: topic.to_string(),
            listener,
        };
        Ok(self.handle(target, active))
    }

    /// Merges `data` into this session's presence in a room and publishes
    /// it. The presence is sent again after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidRoom`] if `data` is not a map or the
    /// room has no listeners, and [`ReactorError::Shutdown`] after
    /// [`Reactor::shutdown`].
    pub fn publish_presence(&self, room_id: &str, data: Value) -> ReactorResult<()> {
        self.shared
            .with_core(|core| core.publish_presence(room_id, data, Instant::now()))
    }

    /// Broadcasts `data` to every other session in a room listening on
    /// `topic`. Broadcasts are not queued.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::NotConnected`] without a joined connection,
    /// [`ReactorError::InvalidRoom`] for an empty room id or topic, and
    /// [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn publish_topic(&self, room_id: &str, topic: &str, data: Value) -> ReactorResult<()> {
        self.shared
            .with_core(|core| core.publish_topic(room_id, topic, data, Instant::now()))
    }

    fn handle(&self, target: Target, active: Arc<AtomicBool>) -> Unsubscribe {
        Unsubscribe {
            shared: Arc::downgrade(&self.shared),
            target,
            active,
        }
    }

    /// Returns the current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.core.lock().connection.status()
    }

    /// Returns a watch receiver that always holds the latest status.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.core.lock().status_tx.subscribe()
    }

    /// Connects now. Re-establishes the connection after [`Reactor::close`],
    /// skips remaining backoff and retries after a credential refusal.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn connect(&self) -> ReactorResult<()> {
        self.shared.with_core(|core| {
            core.check_alive()?;
            core.connection.connect();
            Ok(())
        })
    }

    /// Closes the connection. Subscriptions and pending transactions are
    /// kept and replayed by the next [`Reactor::connect`].
    pub fn close(&self) {
        self.shared.with_core(Core::close);
    }

    /// Releases the transport and clears every registry. Outstanding
    /// settlements resolve to [`ReactorError::Shutdown`]; persisted pending
    /// transactions are left for the next instance. Terminal.
    pub fn shutdown(&self) {
        self.shared.with_core(Core::shutdown);
        self.shared.timer.notify_one();
    }

    /// Returns true once [`Reactor::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.core.lock().shut_down
    }

    /// Replaces the stored credential. Reconnects if the previous one was
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Shutdown`] after [`Reactor::shutdown`].
    pub fn set_credential(&self, token: Option<String>) -> ReactorResult<()> {
        self.shared.with_core(|core| core.set_credential(token))
    }

    /// Reports device connectivity. Equivalent to a [`NetworkListener`] hint.
    pub fn set_online(&self, online: bool) {
        self.shared.with_core(|core| core.set_online(online));
    }

    /// Acts on every backoff and heartbeat deadline at or before `now`.
    pub fn poll_timers(&self, now: Instant) {
        self.shared.with_core(|core| {
            if !core.shut_down {
                core.connection.poll(now);
            }
        });
    }

    /// Returns the earliest instant at which [`Reactor::poll_timers`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.core.lock().connection.next_deadline()
    }

    /// Spawns a task on the current tokio runtime that calls
    /// [`Reactor::poll_timers`] whenever a deadline passes. The task ends
    /// when the reactor is shut down or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_timer_driver(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let notify = Arc::clone(&self.shared.timer);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(shared) = weak.upgrade() else { break };
                    let core = shared.core.lock();
                    if core.shut_down {
                        break;
                    }
                    core.connection.next_deadline()
                };
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                            _ = notify.notified() => {}
                        }
                    }
                    None => notify.notified().await,
                }
                let Some(shared) = weak.upgrade() else { break };
                if !shared.core.lock().shut_down {
                    Reactor { shared }.poll_timers(Instant::now());
                }
            }
            tracing::debug!("[reactor] timer driver stopped");
        })
    }

    /// Returns this device's persistent id.
    pub fn device_id(&self) -> String {
        self.shared.core.lock().device_id.clone()
    }

    /// Returns the number of failed connection attempts since the last
    /// successful join.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.core.lock().connection.attempts()
    }

    /// Returns the number of transactions awaiting the server.
    pub fn pending_mutations(&self) -> usize {
        self.shared.core.lock().queue.len()
    }

    /// Returns the number of distinct active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.core.lock().registry.len()
    }

    /// Returns the number of rooms with at least one listener.
    pub fn room_count(&self) -> usize {
        self.shared.core.lock().rooms.len()
    }

    /// Materializes the current result of an active query without waiting
    /// for a callback. Returns `None` if the query is not subscribed or has
    /// no data yet.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::InvalidQuery`] for a malformed shape.
    pub fn query_result(&self, query: &Value) -> ReactorResult<Option<Dataset>> {
        let query = Query::parse(query).map_err(|e| ReactorError::InvalidQuery(e.to_string()))?;
        let core = self.shared.core.lock();
        Ok(core.registry.materialize(query.id(), &core.queue))
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Reactor")
            .field("status", &core.connection.status())
            .field("subscriptions", &core.registry.len())
            .field("rooms", &core.rooms.len())
            .field("pending_mutations", &core.queue.len())
            .field("shut_down", &core.shut_down)
            .finish()
    }
}

enum Target {
    Query { id: SubscriptionId, listener: u64 },
    Status(u64),
    MutationErrors(u64),
    Presence {
        room_id: String,
        listener: u64,
    },
    Topic {
        room_id: String,
        topic: String,
        listener: u64,
    },
}

/// Handle that ends a subscription.
///
/// Calling [`Unsubscribe::unsubscribe`] more than once has no further
/// effect. Dropping the handle does not unsubscribe.
#[must_use = "dropping the handle keeps the subscription alive; call `unsubscribe` to end it"]
pub struct Unsubscribe {
    shared: Weak<Shared>,
    target: Target,
    active: Arc<AtomicBool>,
}

impl Unsubscribe {
    /// Stops deliveries immediately and releases the subscription.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.with_core(|core| match &self.target {
            Target::Query { id, listener } => core.unsubscribe_query(id, *listener, Instant::now()),
            Target::Status(listener) => {
                core.status_listeners.remove(*listener);
            }
            Target::MutationErrors(listener) => {
                core.mutation_error_listeners.remove(*listener);
            }
            Target::Presence { room_id, listener } => {
                core.unsubscribe_presence(room_id, *listener, Instant::now());
            }
            Target::Topic {
                room_id,
                topic,
                listener,
            } => core.unsubscribe_topic(room_id, topic, *listener, Instant::now()),
        });
    }

    /// Returns true until the subscription has been ended.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns the subscription id for query subscriptions.
    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match &self.target {
            Target::Query { id, .. } => Some(id),
            Target::Status(_)
            | Target::MutationErrors(_)
            | Target::Presence { .. }
            | Target::Topic { .. } => None,
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("subscription", &self.subscription_id())
            .field("active", &self.is_active())
            .finish()
    }
}
