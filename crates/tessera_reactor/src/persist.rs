//! Durable reactor state on top of a [`PersistenceAdapter`].
//!
//! | Key | Contents |
//! |---|---|
//! | `device-id` | UTF-8 device id, generated once |
//! | `credential` | CBOR [`Credential`] |
//! | `pending-mutations` | CBOR queue: next sequence number and unacknowledged entries |
//! | `query-cache` | CBOR list of recent query snapshots, most recent first |
//!
//! Read failures of cached data are logged and treated as absent; a
//! corrupted cache must never prevent the reactor from starting.

use crate::error::ReactorResult;
use crate::mutation::PersistedQueue;
use crate::store::ServerSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_codec::{from_cbor, to_cbor};
use tessera_protocol::SubscriptionId;
use tessera_storage::PersistenceAdapter;
use uuid::Uuid;

const DEVICE_ID_KEY: &str = "device-id";
const CREDENTIAL_KEY: &str = "credential";
const PENDING_KEY: &str = "pending-mutations";
const QUERY_CACHE_KEY: &str = "query-cache";

/// The session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Token sent in the join handshake.
    pub token: String,
    /// False once the server has refused the token.
    pub valid: bool,
}

impl Credential {
    /// Creates a valid credential.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            valid: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedQuery {
    subscription_id: SubscriptionId,
    snapshot: ServerSnapshot,
}

/// Bounded most-recently-used cache of query snapshots.
#[derive(Debug, Default)]
pub(crate) struct QueryCache {
    limit: usize,
    entries: VecDeque<CachedQuery>,
}

impl QueryCache {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn get(&self, id: &SubscriptionId) -> Option<&ServerSnapshot> {
        self.entries
            .iter()
            .find(|e| &e.subscription_id == id)
            .map(|e| &e.snapshot)
    }

    /// Stores a snapshot as the most recent entry. Returns false if caching
    /// is disabled.
    pub(crate) fn put(&mut self, id: &SubscriptionId, snapshot: &ServerSnapshot) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.entries.retain(|e| &e.subscription_id != id);
        self.entries.push_front(CachedQuery {
            subscription_id: id.clone(),
            snapshot: snapshot.clone(),
        });
        self.entries.truncate(self.limit);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Typed access to the reactor's persisted keys.
pub(crate) struct Persistence {
    adapter: Arc<dyn PersistenceAdapter>,
}

impl Persistence {
    pub(crate) fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self { adapter }
    }

    /// Loads the device id, generating and storing one on first use.
    pub(crate) fn load_or_create_device_id(&self) -> ReactorResult<String> {
        if let Some(bytes) = self.adapter.get_item(DEVICE_ID_KEY)? {
            match String::from_utf8(bytes) {
                Ok(id) if !id.is_empty() => return Ok(id),
                _ => tracing::warn!("[persist] device id unreadable, generating a new one"),
            }
        }
        let id = Uuid::new_v4().to_string();
        self.adapter.set_item(DEVICE_ID_KEY, id.as_bytes())?;
        tracing::info!(device_id = %id, "[persist] generated device id");
        Ok(id)
    }

    pub(crate) fn load_credential(&self) -> Option<Credential> {
        self.load(CREDENTIAL_KEY)
    }

    pub(crate) fn save_credential(&self, credential: Option<&Credential>) {
        match credential {
            Some(credential) => self.save(CREDENTIAL_KEY, credential),
            None => {
                if let Err(e) = self.adapter.remove_item(CREDENTIAL_KEY) {
                    tracing::warn!(error = %e, "[persist] failed to clear credential");
                }
            }
        }
    }

    pub(crate) fn load_queue(&self) -> PersistedQueue {
        self.load(PENDING_KEY).unwrap_or_default()
    }

    pub(crate) fn save_queue(&self, queue: &PersistedQueue) {
        self.save(PENDING_KEY, queue);
    }

    pub(crate) fn load_query_cache(&self, limit: usize) -> QueryCache {
        let mut cache = QueryCache::new(limit);
        if limit == 0 {
            return cache;
        }
        let entries: Vec<CachedQuery> = self.load(QUERY_CACHE_KEY).unwrap_or_default();
        cache.entries = entries.into_iter().take(limit).collect();
        cache
    }

    pub(crate) fn save_query_cache(&self, cache: &QueryCache) {
        self.save(QUERY_CACHE_KEY, &cache.entries);
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.adapter.get_item(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "[persist] read failed");
                return None;
            }
        };
        match from_cbor(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "[persist] discarding undecodable value");
                None
            }
        }
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let bytes = match to_cbor(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(key, error = %e, "[persist] failed to encode");
                return;
            }
        };
        if let Err(e) = self.adapter.set_item(key, &bytes) {
            tracing::warn!(key, error = %e, "[persist] write failed");
        }
    }
}
