//! Transaction operations.

use crate::dataset::{Attributes, Dataset, EntityKey};
use serde::{Deserialize, Serialize};
use tessera_codec::{CodecError, CodecResult};

/// A single write inside a transaction.
///
/// Operations are applied in order, first optimistically on the client and
/// later authoritatively by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Operation {
    /// Sets attributes on an entity, creating it if absent.
    Update {
        /// Target entity.
        key: EntityKey,
        /// Attributes to set.
        attrs: Attributes,
    },
    /// Deep-merges map attributes into an entity, creating it if absent.
    Merge {
        /// Target entity.
        key: EntityKey,
        /// Attributes to merge.
        attrs: Attributes,
    },
    /// Removes an entity.
    Delete {
        /// Target entity.
        key: EntityKey,
    },
    /// Adds entity ids to a link attribute, creating the entity if absent.
    Link {
        /// Source entity.
        key: EntityKey,
        /// Link attribute name.
        label: String,
        /// Ids of the linked entities.
        targets: Vec<String>,
    },
    /// Removes entity ids from a link attribute.
    Unlink {
        /// Source entity.
        key: EntityKey,
        /// Link attribute name.
        label: String,
        /// Ids to remove.
        targets: Vec<String>,
    },
}

impl Operation {
    /// Creates an update operation.
    pub fn update(namespace: &str, id: &str, attrs: Attributes) -> Self {
        Operation::Update {
            key: EntityKey::new(namespace, id),
            attrs,
        }
    }

    /// Creates a merge operation.
    pub fn merge(namespace: &str, id: &str, attrs: Attributes) -> Self {
        Operation::Merge {
            key: EntityKey::new(namespace, id),
            attrs,
        }
    }

    /// Creates a delete operation.
    pub fn delete(namespace: &str, id: &str) -> Self {
        Operation::Delete {
            key: EntityKey::new(namespace, id),
        }
    }

    /// Creates a link operation.
    pub fn link(namespace: &str, id: &str, label: &str, targets: &[&str]) -> Self {
        Operation::Link {
            key: EntityKey::new(namespace, id),
            label: label.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Creates an unlink operation.
    pub fn unlink(namespace: &str, id: &str, label: &str, targets: &[&str]) -> Self {
        Operation::Unlink {
            key: EntityKey::new(namespace, id),
            label: label.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Returns the entity this operation targets.
    pub fn key(&self) -> &EntityKey {
        match self {
            Operation::Update { key, .. }
            | Operation::Merge { key, .. }
            | Operation::Delete { key }
            | Operation::Link { key, .. }
            | Operation::Unlink { key, .. } => key,
        }
    }

    /// Returns the namespace this operation targets.
    pub fn namespace(&self) -> &str {
        &self.key().namespace
    }

    /// Applies this operation to a dataset.
    pub fn apply(&self, data: &mut Dataset) {
        match self {
            Operation::Update { key, attrs } => data.update(key, attrs),
            Operation::Merge { key, attrs } => data.merge(key, attrs),
            Operation::Delete { key } => {
                data.delete(key);
            }
            Operation::Link {
                key,
                label,
                targets,
            } => data.link(key, label, targets),
            Operation::Unlink {
                key,
                label,
                targets,
            } => data.unlink(key, label, targets),
        }
    }

    /// Checks that the operation addresses a real entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or id is empty, or if a link names
    /// no attribute or an empty target id.
    pub fn validate(&self) -> CodecResult<()> {
        let key = self.key();
        if key.namespace.is_empty() {
            return Err(CodecError::invalid_structure("operation namespace is empty"));
        }
        if key.id.is_empty() {
            return Err(CodecError::invalid_structure("operation entity id is empty"));
        }
        if let Operation::Link { label, targets, .. } | Operation::Unlink { label, targets, .. } =
            self
        {
            if label.is_empty() {
                return Err(CodecError::invalid_structure("link label is empty"));
            }
            if targets.iter().any(String::is_empty) {
                return Err(CodecError::invalid_structure("link target id is empty"));
            }
        }
        Ok(())
    }
}
