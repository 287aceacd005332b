//! Local store: composes server snapshots with the optimistic overlay.
//!
//! Nothing here holds state of its own. A subscription's materialized result
//! is always recomputed from scratch as
//! `filter(snapshot + pending mutations in sequence order)`, so the view can
//! never drift from its inputs.

use serde::{Deserialize, Serialize};
use tessera_protocol::{Dataset, PatchBody, Query};

/// Last authoritative state received for one subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Server version of this snapshot.
    pub version: u64,
    /// Entities in the query result.
    pub data: Dataset,
}

impl ServerSnapshot {
    /// Creates a snapshot.
    pub fn new(version: u64, data: Dataset) -> Self {
        Self { version, data }
    }
}

/// What happened to an inbound patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The snapshot changed.
    Applied,
    /// Delta older than or equal to the current version.
    StaleVersion,
    /// Delta with no snapshot to apply it to, or while a full refetch is due.
    AwaitingFull,
}

/// Applies a patch to a subscription's snapshot.
///
/// Full patches always replace the snapshot; they are the server's
/// authoritative answer for the query. Deltas apply only on top of a trusted
/// snapshot and only when they advance the version.
pub fn apply_patch(
    snapshot: &mut Option<ServerSnapshot>,
    awaiting_full: bool,
    version: u64,
    body: &PatchBody,
) -> PatchOutcome {
    match body {
        PatchBody::Full { data } => {
            *snapshot = Some(ServerSnapshot::new(version, data.clone()));
            PatchOutcome::Applied
        }
        PatchBody::Delta { upserts, deletes } => {
            let Some(current) = snapshot.as_mut().filter(|_| !awaiting_full) else {
                return PatchOutcome::AwaitingFull;
            };
            if version <= current.version {
                return PatchOutcome::StaleVersion;
            }
            for upsert in upserts {
                current.data.put(&upsert.key, upsert.attrs.clone());
            }
            for key in deletes {
                current.data.delete(key);
            }
            current.version = version;
            PatchOutcome::Applied
        }
    }
}

/// Computes the result delivered to a subscription's listeners.
///
/// Returns `None` until the subscription has a snapshot. Pending operations
/// are applied in the order given, skipping namespaces the query does not
/// read; the query's filters run last so optimistic writes enter or leave
/// the result exactly as the server would decide.
pub fn materialize<'a>(
    snapshot: Option<&ServerSnapshot>,
    query: &Query,
    pending: impl IntoIterator<Item = &'a tessera_protocol::Operation>,
) -> Option<Dataset> {
    let mut data = snapshot?.data.clone();

    for op in pending {
        if query.touches(op.namespace()) {
            op.apply(&mut data);
        }
    }

    let mut result = Dataset::new();
    for namespace in query.namespaces() {
        let (Some(filter), Some(entities)) = (query.filter(namespace), data.namespace(namespace))
        else {
            continue;
        };
        for (id, attrs) in entities {
            if filter.matches(attrs) {
                result.put(
                    &tessera_protocol::EntityKey::new(namespace, id.as_str()),
                    attrs.clone(),
                );
            }
        }
    }
    Some(result)
}
