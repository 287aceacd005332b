//! Fixtures: reactors wired to a recording transport, plus builders for
//! queries, operations and server messages.

use crate::transport::RecordingTransport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tessera_codec::Value;
use tessera_protocol::{
    Attributes, Dataset, EntityKey, EntityUpsert, ErrorCode, Operation, PatchBody, Query,
    RejectReason, ServerMessage, SubscriptionId,
};
use tessera_reactor::{Reactor, ReactorConfig, RetryConfig};
use tessera_storage::{FileStore, InMemoryStore, PersistenceAdapter};

/// Configuration with short, deterministic backoff and no heartbeat.
pub fn test_config() -> ReactorConfig {
    ReactorConfig::new("test-app", "mem://test")
        .with_retry(
            RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100)).with_jitter(false),
        )
        .without_heartbeat()
}

/// A reactor wired to a [`RecordingTransport`] and an in-memory store.
pub struct Harness {
    /// The reactor under test.
    pub reactor: Reactor,
    /// The scripted transport.
    pub transport: Arc<RecordingTransport>,
    /// The persistence backing the reactor. Clones share state.
    pub store: InMemoryStore,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Creates a harness with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with a custom configuration.
    pub fn with_config(config: ReactorConfig) -> Self {
        Self::with_store(config, InMemoryStore::new())
    }

    /// Creates a harness over an existing store, e.g. to simulate a restart.
    pub fn with_store(config: ReactorConfig, store: InMemoryStore) -> Self {
        let transport = RecordingTransport::new();
        let adapter: Arc<dyn PersistenceAdapter> = Arc::new(store.clone());
        let reactor = Reactor::builder(config, transport.clone())
            .with_persistence(adapter)
            .build()
            .expect("reactor builds");
        Self {
            reactor,
            transport,
            store,
        }
    }
}

/// A reactor persisting to a [`FileStore`] in a temporary directory.
///
/// The directory lives as long as the harness, across restarts.
pub struct FileHarness {
    /// The reactor under test.
    pub reactor: Reactor,
    /// The scripted transport of the current instance.
    pub transport: Arc<RecordingTransport>,
    dir: TempDir,
}

impl Default for FileHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHarness {
    /// Creates a harness with [`test_config`] over a fresh directory.
    pub fn new() -> Self {
        Self::open(tempfile::tempdir().expect("temporary directory"))
    }

    fn open(dir: TempDir) -> Self {
        let store = FileStore::open(dir.path()).expect("file store opens");
        let adapter: Arc<dyn PersistenceAdapter> = Arc::new(store);
        let transport = RecordingTransport::new();
        let reactor = Reactor::builder(test_config(), transport.clone())
            .with_persistence(adapter)
            .build()
            .expect("reactor builds");
        Self {
            reactor,
            transport,
            dir,
        }
    }

    /// The directory backing the store.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Drops the reactor, releasing the directory lock, and builds a new
    /// one over the same directory with a fresh transport.
    pub fn restart(self) -> Self {
        let Self { reactor, dir, .. } = self;
        drop(reactor);
        Self::open(dir)
    }
}

/// Collects values passed to a callback.
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A callback taking values by reference.
    pub fn sink(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |value: &T| values.lock().push(value.clone())
    }

    /// A callback taking values by value.
    pub fn sink_owned(&self) -> impl Fn(T) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |value: T| values.lock().push(value)
    }

    /// Every value recorded so far.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    /// The most recent value.
    pub fn last(&self) -> Option<T> {
        self.values.lock().last().cloned()
    }

    /// Number of values recorded.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Forgets every recorded value.
    pub fn clear(&self) {
        self.values.lock().clear();
    }
}

/// Builds a query shape from JSON.
pub fn query(shape: serde_json::Value) -> Value {
    Value::from(shape)
}

/// Subscription id of a query shape.
pub fn subscription_id(shape: &Value) -> SubscriptionId {
    Query::parse(shape).expect("valid query").id().clone()
}

/// Builds an attribute map from a JSON object.
pub fn attrs(object: serde_json::Value) -> Attributes {
    Value::from(object)
        .as_map()
        .cloned()
        .expect("attributes must be a JSON object")
}

/// An `update` setting `title`.
pub fn set_title(namespace: &str, id: &str, title: &str) -> Operation {
    Operation::update(namespace, id, attrs(serde_json::json!({ "title": title })))
}

/// Builds a dataset from `(namespace, id, attributes)` triples.
pub fn dataset(entities: &[(&str, &str, serde_json::Value)]) -> Dataset {
    let mut data = Dataset::new();
    for (namespace, id, object) in entities {
        data.put(&EntityKey::new(*namespace, *id), attrs(object.clone()));
    }
    data
}

/// Title of an entity in a result, if present.
pub fn title_of(data: &Dataset, namespace: &str, id: &str) -> Option<String> {
    data.get(&EntityKey::new(namespace, id))
        .and_then(|a| a.get("title"))
        .and_then(|v| v.as_text())
        .map(str::to_string)
}

/// A full-snapshot patch.
pub fn full_patch(id: &SubscriptionId, version: u64, data: Dataset) -> ServerMessage {
    ServerMessage::Patch {
        subscription_id: id.clone(),
        version,
        body: PatchBody::Full { data },
    }
}

/// A delta patch.
pub fn delta_patch(
    id: &SubscriptionId,
    version: u64,
    upserts: &[(&str, &str, serde_json::Value)],
    deletes: &[(&str, &str)],
) -> ServerMessage {
    ServerMessage::Patch {
        subscription_id: id.clone(),
        version,
        body: PatchBody::Delta {
            upserts: upserts
                .iter()
                .map(|(ns, entity, object)| EntityUpsert {
                    key: EntityKey::new(*ns, *entity),
                    attrs: attrs(object.clone()),
                })
                .collect(),
            deletes: deletes.iter().map(|(ns, entity)| EntityKey::new(*ns, *entity)).collect(),
        },
    }
}

/// An `ack` for `seq`.
pub fn ack(seq: u64) -> ServerMessage {
    ServerMessage::Ack { seq }
}

/// A `reject` for `seq`.
pub fn reject(seq: u64, code: &str) -> ServerMessage {
    ServerMessage::Reject {
        seq,
        reason: RejectReason::new(code, format!("transaction {seq} refused")),
    }
}

/// A server `error`.
pub fn server_error(code: ErrorCode, message: &str) -> ServerMessage {
    ServerMessage::Error {
        code,
        message: message.into(),
        subscription_id: None,
    }
}

/// A `join-room-ok` for `room_id`.
pub fn room_joined(room_id: &str) -> ServerMessage {
    ServerMessage::JoinRoomOk {
        room_id: room_id.into(),
    }
}

/// A `refresh-presence` listing every session in the room, this client's
/// included.
pub fn refresh_presence(room_id: &str, peers: &[(&str, serde_json::Value)]) -> ServerMessage {
    ServerMessage::RefreshPresence {
        room_id: room_id.into(),
        peers: peers
            .iter()
            .map(|(session, data)| (session.to_string(), Value::from(data.clone())))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// A `server-broadcast` from `peer_id`.
pub fn broadcast(room_id: &str, topic: &str, peer_id: &str, data: serde_json::Value) -> ServerMessage {
    ServerMessage::ServerBroadcast {
        room_id: room_id.into(),
        topic: topic.into(),
        peer_id: peer_id.into(),
        data: Value::from(data),
    }
}
