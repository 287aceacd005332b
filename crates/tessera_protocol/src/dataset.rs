//! Entity data grouped by namespace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_codec::Value;

/// Attribute map of a single entity.
pub type Attributes = BTreeMap<String, Value>;

/// Identifies one entity: its namespace and id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Namespace (entity type), e.g. `todos`.
    pub namespace: String,
    /// Entity id within the namespace.
    pub id: String,
}

impl EntityKey {
    /// Creates a new entity key.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

/// A set of entities, grouped by namespace then id.
///
/// Used both as the payload of a full patch and as the body of a server
/// snapshot. Iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Entities per namespace, keyed by id.
    pub namespaces: BTreeMap<String, BTreeMap<String, Attributes>>,
}

impl Dataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the attributes of an entity.
    pub fn get(&self, key: &EntityKey) -> Option<&Attributes> {
        self.namespaces.get(&key.namespace)?.get(&key.id)
    }

    /// Returns the entities of one namespace.
    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, Attributes>> {
        self.namespaces.get(namespace)
    }

    /// Inserts or replaces an entity.
    pub fn put(&mut self, key: &EntityKey, attrs: Attributes) {
        self.namespaces
            .entry(key.namespace.clone())
            .or_default()
            .insert(key.id.clone(), attrs);
    }

    /// Sets attributes on an entity, creating it if absent.
    pub fn update(&mut self, key: &EntityKey, attrs: &Attributes) {
        let entity = self
            .namespaces
            .entry(key.namespace.clone())
            .or_default()
            .entry(key.id.clone())
            .or_default();
        for (name, value) in attrs {
            entity.insert(name.clone(), value.clone());
        }
    }

    /// Deep-merges attributes into an entity, creating it if absent.
    pub fn merge(&mut self, key: &EntityKey, attrs: &Attributes) {
        let entity = self
            .namespaces
            .entry(key.namespace.clone())
            .or_default()
            .entry(key.id.clone())
            .or_default();
        for (name, value) in attrs {
            match entity.get_mut(name) {
                Some(existing) => existing.merge(value),
                None => {
                    entity.insert(name.clone(), value.clone());
                }
            }
        }
    }

    /// Adds entity ids to a link attribute, creating the entity if absent.
    ///
    /// A link attribute is an array of ids. Ids already present are kept in
    /// place; a non-array value under `label` is replaced.
    pub fn link(&mut self, key: &EntityKey, label: &str, targets: &[String]) {
        let entity = self
            .namespaces
            .entry(key.namespace.clone())
            .or_default()
            .entry(key.id.clone())
            .or_default();
        let slot = entity
            .entry(label.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !matches!(slot, Value::Array(_)) {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(ids) = slot {
            for target in targets {
                let target = Value::from(target.as_str());
                if !ids.contains(&target) {
                    ids.push(target);
                }
            }
        }
    }

    /// Removes entity ids from a link attribute. Missing entities, labels
    /// and ids are ignored.
    pub fn unlink(&mut self, key: &EntityKey, label: &str, targets: &[String]) {
        let Some(entity) = self
            .namespaces
            .get_mut(&key.namespace)
            .and_then(|entities| entities.get_mut(&key.id))
        else {
            return;
        };
        if let Some(Value::Array(ids)) = entity.get_mut(label) {
            ids.retain(|id| !targets.iter().any(|t| id.as_text() == Some(t.as_str())));
        }
    }

    /// Removes an entity. Returns true if it existed.
    pub fn delete(&mut self, key: &EntityKey) -> bool {
        let Some(entities) = self.namespaces.get_mut(&key.namespace) else {
            return false;
        };
        let removed = entities.remove(&key.id).is_some();
        if entities.is_empty() {
            self.namespaces.remove(&key.namespace);
        }
        removed
    }

    /// Returns the total number of entities.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    /// Returns true if there are no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn update_creates_and_overwrites() {
        let mut data = Dataset::new();
        let key = EntityKey::new("todos", "1");

        data.update(&key, &attrs(&[("title", "a".into()), ("done", false.into())]));
        data.update(&key, &attrs(&[("title", "b".into())]));

        let entity = data.get(&key).unwrap();
        assert_eq!(entity.get("title"), Some(&Value::from("b")));
        assert_eq!(entity.get("done"), Some(&Value::from(false)));
    }

    #[test]
    fn merge_is_deep() {
        let mut data = Dataset::new();
        let key = EntityKey::new("docs", "d");
        data.put(
            &key,
            attrs(&[("meta", Value::map([("a", Value::from(1))]))]),
        );
        data.merge(&key, &attrs(&[("meta", Value::map([("b", Value::from(2))]))]));

        let meta = data.get(&key).unwrap().get("meta").unwrap();
        assert_eq!(meta.get("a"), Some(&Value::from(1)));
        assert_eq!(meta.get("b"), Some(&Value::from(2)));
    }

    #[test]
    fn delete_prunes_empty_namespaces() {
        let mut data = Dataset::new();
        let key = EntityKey::new("todos", "1");
        data.put(&key, Attributes::new());

        assert!(data.delete(&key));
        assert!(!data.delete(&key));
        assert!(data.namespace("todos").is_none());
        assert!(data.is_empty());
    }

    #[test]
    fn link_appends_distinct_ids_and_unlink_removes_them() {
        let mut data = Dataset::new();
        let key = EntityKey::new("todos", "1");
        let ids = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();

        data.link(&key, "owners", &ids(&["u1", "u2"]));
        data.link(&key, "owners", &ids(&["u2", "u3"]));
        let owners = data.get(&key).unwrap().get("owners").unwrap();
        assert_eq!(
            owners,
            &Value::Array(vec!["u1".into(), "u2".into(), "u3".into()])
        );

        data.unlink(&key, "owners", &ids(&["u1", "missing"]));
        let owners = data.get(&key).unwrap().get("owners").unwrap();
        assert_eq!(owners, &Value::Array(vec!["u2".into(), "u3".into()]));

        data.unlink(&EntityKey::new("todos", "absent"), "owners", &ids(&["u2"]));
        assert_eq!(data.len(), 1);
    }
}
