//! Query shapes and their content-addressed identifiers.

use crate::dataset::Attributes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tessera_codec::{canonical_bytes, CodecError, CodecResult, Value};

/// Option key holding attribute equalities.
const WHERE_KEY: &str = "where";

/// Content-addressed identifier of a query shape.
///
/// Two structurally equal shapes always produce the same id, in any process,
/// so an id stays valid across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Derives the id of a canonical shape.
    fn from_shape(shape: &Value) -> CodecResult<Self> {
        let bytes = canonical_bytes(shape)?;
        let digest = Sha256::digest(&bytes);
        let hex = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        Ok(Self(hex))
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-namespace options of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceFilter {
    /// Attribute equalities every returned entity must satisfy.
    pub equals: Attributes,
}

impl NamespaceFilter {
    /// Returns true if the entity satisfies every equality.
    pub fn matches(&self, attrs: &Attributes) -> bool {
        self.equals
            .iter()
            .all(|(name, expected)| attrs.get(name) == Some(expected))
    }
}

/// A validated query shape.
///
/// A shape is a map from namespace to options, e.g.
/// `{"todos": {"where": {"done": false}}, "users": {}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    shape: Value,
    namespaces: BTreeMap<String, NamespaceFilter>,
    id: SubscriptionId,
}

impl Query {
    /// Parses and validates a query shape.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidStructure`] if the shape is not a non-empty
    /// map of namespace to option maps, or uses an unknown option.
    pub fn parse(shape: &Value) -> CodecResult<Self> {
        let map = shape
            .as_map()
            .ok_or_else(|| CodecError::invalid_structure("query must be a map"))?;
        if map.is_empty() {
            return Err(CodecError::invalid_structure("query names no namespaces"));
        }

        let mut namespaces = BTreeMap::new();
        for (namespace, options) in map {
            if namespace.is_empty() {
                return Err(CodecError::invalid_structure("empty namespace in query"));
            }
            let options = options.as_map().ok_or_else(|| {
                CodecError::invalid_structure(format!("options for `{namespace}` must be a map"))
            })?;

            let mut filter = NamespaceFilter::default();
            for (key, value) in options {
                match key.as_str() {
                    WHERE_KEY => {
                        let equals = value.as_map().ok_or_else(|| {
                            CodecError::invalid_structure(format!(
                                "`where` for `{namespace}` must be a map"
                            ))
                        })?;
                        filter.equals = equals.clone();
                    }
                    other => {
                        return Err(CodecError::invalid_structure(format!(
                            "unknown query option `{other}` for `{namespace}`"
                        )))
                    }
                }
            }
            namespaces.insert(namespace.clone(), filter);
        }

        let id = SubscriptionId::from_shape(shape)?;
        Ok(Self {
            shape: shape.clone(),
            namespaces,
            id,
        })
    }

    /// Returns the content-addressed id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Returns the shape as sent on the wire.
    pub fn shape(&self) -> &Value {
        &self.shape
    }

    /// Returns the namespaces this query reads.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Returns true if the query reads the given namespace.
    pub fn touches(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Returns the filter for a namespace.
    pub fn filter(&self, namespace: &str) -> Option<&NamespaceFilter> {
        self.namespaces.get(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: serde_json::Value) -> CodecResult<Query> {
        Query::parse(&Value::from(json))
    }

    #[test]
    fn equivalent_shapes_share_an_id() {
        let a = parse(json!({"todos": {"where": {"done": false, "owner": "u1"}}, "users": {}}))
            .unwrap();
        let b = parse(json!({"users": {}, "todos": {"where": {"owner": "u1", "done": false}}}))
            .unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_shapes_differ() {
        let a = parse(json!({"todos": {}})).unwrap();
        let b = parse(json!({"todos": {"where": {"done": true}}})).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().as_str().len(), 32);
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        assert!(parse(json!([])).is_err());
        assert!(parse(json!({})).is_err());
        assert!(parse(json!({"todos": 1})).is_err());
        assert!(parse(json!({"todos": {"limit": 3}})).is_err());
        assert!(parse(json!({"todos": {"where": [1]}})).is_err());
        assert!(parse(json!({"": {}})).is_err());
    }

    #[test]
    fn filter_matches_equalities() {
        let q = parse(json!({"todos": {"where": {"done": false}}})).unwrap();
        let filter = q.filter("todos").unwrap();

        let open: Attributes = [("done".to_string(), Value::from(false))].into();
        let closed: Attributes = [("done".to_string(), Value::from(true))].into();
        assert!(filter.matches(&open));
        assert!(!filter.matches(&closed));
        assert!(!filter.matches(&Attributes::new()));
        assert!(q.touches("todos"));
        assert!(!q.touches("users"));
    }

    proptest::proptest! {
        #[test]
        fn id_ignores_insertion_order(
            entries in proptest::collection::btree_map("[a-z]{1,6}", proptest::bool::ANY, 1..6)
        ) {
            let forward: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(ns, done)| (ns.clone(), json!({"where": {"done": done}})))
                .collect();
            let reverse: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .rev()
                .map(|(ns, done)| (ns.clone(), json!({"where": {"done": done}})))
                .collect();
            let a = parse(serde_json::Value::Object(forward)).unwrap();
            let b = parse(serde_json::Value::Object(reverse)).unwrap();
            proptest::prop_assert_eq!(a.id(), b.id());
        }
    }
}
