//! Mutation queue: the ordered log of unconfirmed local transactions.
//!
//! ## Invariants
//!
//! - Sequence numbers are assigned monotonically and never reused
//! - Entries are never reordered
//! - Entries leave the queue only from the head, in enqueue order; an
//!   outcome that arrives for a later entry waits until every earlier entry
//!   has its own outcome
//! - A settlement completes only on ack or reject, never on local application

use crate::error::{ReactorError, ReactorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tessera_protocol::{EntityKey, Operation, RejectReason};
use tokio::sync::oneshot;

/// Successful outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationAck {
    /// Local sequence number of the acknowledged transaction.
    pub seq: u64,
}

/// Status of a queued mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MutationStatus {
    /// Waiting for the server.
    Pending,
    /// The server committed it; waiting for earlier entries to settle.
    Acknowledged,
    /// The server refused it; waiting for earlier entries to settle.
    Rejected(RejectReason),
}

/// A transaction the server refused, as reported to mutation error listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationError {
    /// Local sequence number of the transaction.
    pub seq: u64,
    /// Reason reported by the server.
    pub reason: RejectReason,
    /// The operations that were rolled back.
    pub operations: Vec<Operation>,
}

type SettleSender = oneshot::Sender<ReactorResult<MutationAck>>;

/// One not-yet-confirmed local write.
#[derive(Debug)]
pub(crate) struct PendingMutation {
    seq: u64,
    operations: Vec<Operation>,
    status: MutationStatus,
    settle: Option<SettleSender>,
}

impl PendingMutation {
    /// Returns the local sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the operations, in application order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Returns the status.
    pub fn status(&self) -> &MutationStatus {
        &self.status
    }
}

/// Handle to the eventual outcome of a transaction.
///
/// Resolves to `Ok` when the server acknowledges the transaction and to
/// [`ReactorError::Rejected`] when it refuses it. Resolves to
/// [`ReactorError::Shutdown`] if the reactor is shut down first. While the
/// connection stays down it does not resolve at all.
#[derive(Debug)]
#[must_use = "a settlement reports whether the server accepted the transaction"]
pub struct Settlement {
    seq: u64,
    rx: oneshot::Receiver<ReactorResult<MutationAck>>,
}

impl Settlement {
    /// Returns the local sequence number of the transaction.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the outcome if it is already known, without waiting.
    ///
    /// Once this has returned `Some`, the settlement must not be polled again.
    pub fn try_result(&mut self) -> Option<ReactorResult<MutationAck>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ReactorError::Shutdown)),
        }
    }
}

impl Future for Settlement {
    type Output = ReactorResult<MutationAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ReactorError::Shutdown)))
    }
}

/// An entry removed from the head of the queue.
#[derive(Debug)]
pub(crate) struct Resolved {
    pub(crate) seq: u64,
    pub(crate) operations: Vec<Operation>,
    pub(crate) outcome: Result<(), RejectReason>,
    settle: Option<SettleSender>,
}

impl Resolved {
    /// Completes the caller's settlement. Returns false if no caller holds
    /// one (a restored entry, or a dropped handle).
    pub(crate) fn settle(&mut self) -> bool {
        let Some(tx) = self.settle.take() else {
            return false;
        };
        let result = match &self.outcome {
            Ok(()) => Ok(MutationAck { seq: self.seq }),
            Err(reason) => Err(ReactorError::Rejected {
                seq: self.seq,
                reason: reason.clone(),
            }),
        };
        tx.send(result).is_ok()
    }
}

/// Result of recording a server outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// Outcome stored.
    Stored,
    /// No pending entry has that sequence number.
    Unknown,
    /// The entry already has an outcome.
    Duplicate,
}

/// Durable form of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct PersistedQueue {
    pub(crate) next_seq: u64,
    pub(crate) entries: Vec<PersistedMutation>,
}

/// Durable form of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PersistedMutation {
    pub(crate) seq: u64,
    pub(crate) operations: Vec<Operation>,
}

/// The ordered log of unconfirmed transactions.
#[derive(Debug)]
pub(crate) struct MutationQueue {
    entries: VecDeque<PendingMutation>,
    next_seq: u64,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
        }
    }
}

impl MutationQueue {
    /// Rebuilds a queue from its durable form. Restored entries have no
    /// settlement handle.
    pub(crate) fn restore(persisted: PersistedQueue) -> Self {
        let mut entries: Vec<PersistedMutation> = persisted.entries;
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);
        let after_last = entries.last().map_or(1, |e| e.seq + 1);
        Self {
            next_seq: persisted.next_seq.max(after_last),
            entries: entries
                .into_iter()
                .map(|e| PendingMutation {
                    seq: e.seq,
                    operations: e.operations,
                    status: MutationStatus::Pending,
                    settle: None,
                })
                .collect(),
        }
    }

    pub(crate) fn to_persisted(&self) -> PersistedQueue {
        PersistedQueue {
            next_seq: self.next_seq,
            entries: self
                .entries
                .iter()
                .map(|e| PersistedMutation {
                    seq: e.seq,
                    operations: e.operations.clone(),
                })
                .collect(),
        }
    }

    /// Appends a transaction at the tail.
    pub(crate) fn enqueue(&mut self, operations: Vec<Operation>) -> Settlement {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(PendingMutation {
            seq,
            operations,
            status: MutationStatus::Pending,
            settle: Some(tx),
        });
        Settlement { seq, rx }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    /// Every queued operation, in sequence order.
    pub(crate) fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().flat_map(|e| e.operations.iter())
    }

    /// Records the server's verdict for `seq`.
    pub(crate) fn record(&mut self, seq: u64, outcome: Result<(), RejectReason>) -> Recorded {
        let Some(entry) = self.entries.iter_mut().find(|e| e.seq == seq) else {
            return Recorded::Unknown;
        };
        if entry.status != MutationStatus::Pending {
            return Recorded::Duplicate;
        }
        entry.status = match outcome {
            Ok(()) => MutationStatus::Acknowledged,
            Err(reason) => MutationStatus::Rejected(reason),
        };
        Recorded::Stored
    }

    /// Removes every settled entry at the head, stopping at the first that
    /// is still pending.
    ///
    /// A rejection recorded behind a pending entry stays in the queue, and
    /// its optimistic effect stays visible, until every earlier entry has
    /// settled.
    pub(crate) fn drain_settled(&mut self) -> Vec<Resolved> {
        let mut resolved = Vec::new();
        while self
            .entries
            .front()
            .is_some_and(|e| e.status != MutationStatus::Pending)
        {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            let outcome = match entry.status {
                MutationStatus::Rejected(reason) => Err(reason),
                MutationStatus::Acknowledged | MutationStatus::Pending => Ok(()),
            };
            resolved.push(Resolved {
                seq: entry.seq,
                operations: entry.operations,
                outcome,
                settle: entry.settle,
            });
        }
        resolved
    }

    /// Namespaces whose optimistic state can no longer be trusted after
    /// `rejected` is dropped: its own, plus those of every remaining entry
    /// that writes an entity it wrote (transitively).
    pub(crate) fn dependent_namespaces(&self, rejected: &[Operation]) -> BTreeSet<String> {
        let mut keys: BTreeSet<EntityKey> = rejected.iter().map(|op| op.key().clone()).collect();
        let mut namespaces: BTreeSet<String> =
            rejected.iter().map(|op| op.namespace().to_string()).collect();

        for entry in &self.entries {
            if entry.operations.iter().any(|op| keys.contains(op.key())) {
                for op in &entry.operations {
                    keys.insert(op.key().clone());
                    namespaces.insert(op.namespace().to_string());
                }
            }
        }
        namespaces
    }

    /// Removes every entry, failing outstanding settlements.
    pub(crate) fn fail_all(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            if let Some(tx) = entry.settle {
                let _ = tx.send(Err(ReactorError::Shutdown));
            }
        }
        count
    }
}
