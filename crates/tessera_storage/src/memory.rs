//! In-memory persistence adapter.

use crate::adapter::PersistenceAdapter;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory persistence adapter.
///
/// Suitable for:
/// - Unit and integration tests
/// - Clients that do not need state to survive a restart
///
/// Clones share the same underlying map, which lets a test hand one clone to
/// a reactor and inspect or pre-seed state through another.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{InMemoryStore, PersistenceAdapter};
///
/// let store = InMemoryStore::new();
/// store.set_item("device-id", b"abc").unwrap();
/// assert_eq!(store.get_item("device-id").unwrap(), Some(b"abc".to_vec()));
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    items: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl PersistenceAdapter for InMemoryStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.items.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.items.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_item("nope").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let store = InMemoryStore::new();
        store.set_item("k", b"one").unwrap();
        store.set_item("k", b"two").unwrap();
        assert_eq!(store.get_item("k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = InMemoryStore::new();
        let view = store.clone();
        store.set_item("a", b"1").unwrap();
        store.set_item("b", b"2").unwrap();
        view.remove_item("a").unwrap();
        assert_eq!(store.keys(), vec!["b".to_string()]);
    }
}
