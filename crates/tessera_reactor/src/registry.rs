//! Subscription registry: many logical queries over one connection.
//!
//! Subscriptions are keyed by the content-addressed [`SubscriptionId`] of
//! their query, so structurally equal queries share one wire subscription.
//! The listener count is the reference count; the subscription is torn down
//! when it reaches zero.

use crate::listeners::{Callback, ListenerSet, Outbox};
use crate::mutation::MutationQueue;
use crate::store::{self, PatchOutcome, ServerSnapshot};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessera_protocol::{Dataset, PatchBody, Query, SubscriptionId};

/// One logical query registered by the application.
pub(crate) struct Subscription {
    query: Query,
    order: u64,
    listeners: ListenerSet<Dataset>,
    snapshot: Option<ServerSnapshot>,
    last_result: Option<Arc<Dataset>>,
    awaiting_full: bool,
}

impl Subscription {
    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn snapshot(&self) -> Option<&ServerSnapshot> {
        self.snapshot.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.listeners.len()
    }

    fn recompute(&mut self, queue: &MutationQueue, outbox: &mut Outbox) -> bool {
        let Some(result) = store::materialize(self.snapshot.as_ref(), &self.query, queue.operations())
        else {
            return false;
        };
        if self.last_result.as_deref() == Some(&result) {
            return false;
        }
        let result = Arc::new(result);
        self.listeners.notify_all(&result, outbox);
        self.last_result = Some(result);
        true
    }
}

/// Which subscriptions a recompute covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Every subscription.
    All,
    /// Subscriptions reading any of these namespaces.
    Namespaces(BTreeSet<String>),
    /// One subscription.
    One(SubscriptionId),
}

impl Scope {
    fn covers(&self, id: &SubscriptionId, query: &Query) -> bool {
        match self {
            Scope::All => true,
            Scope::Namespaces(namespaces) => namespaces.iter().any(|ns| query.touches(ns)),
            Scope::One(target) => target == id,
        }
    }
}

/// Result of adding a listener.
pub(crate) struct Registration {
    pub(crate) id: SubscriptionId,
    pub(crate) listener: u64,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) created: bool,
}

/// Result of removing a listener.
#[derive(Debug, PartialEq)]
pub(crate) enum Removal {
    /// Nothing registered under that id.
    NotFound,
    /// Other listeners remain.
    Remaining(usize),
    /// That was the last listener; the subscription is gone.
    Last,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_order: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    /// Adds a listener, creating the subscription on first use.
    pub(crate) fn add(
        &mut self,
        query: Query,
        callback: Callback<Dataset>,
        cached: Option<ServerSnapshot>,
    ) -> Registration {
        let id = query.id().clone();
        let created = !self.subscriptions.contains_key(&id);
        let order = self.next_order;
        let subscription = self.subscriptions.entry(id.clone()).or_insert_with(|| Subscription {
            query,
            order,
            listeners: ListenerSet::default(),
            snapshot: cached,
            last_result: None,
            awaiting_full: true,
        });
        if created {
            self.next_order += 1;
        }
        let (listener, active) = subscription.listeners.add(callback);
        Registration {
            id,
            listener,
            active,
            created,
        }
    }

    /// Removes a listener. At zero the subscription is dropped.
    pub(crate) fn remove(&mut self, id: &SubscriptionId, listener: u64) -> Removal {
        let Some(subscription) = self.subscriptions.get_mut(id) else {
            return Removal::NotFound;
        };
        if !subscription.listeners.remove(listener) {
            return Removal::NotFound;
        }
        if subscription.listeners.is_empty() {
            self.subscriptions.remove(id);
            Removal::Last
        } else {
            Removal::Remaining(subscription.listeners.len())
        }
    }

    /// Subscriptions in ascending creation order.
    pub(crate) fn in_creation_order(&self) -> Vec<(&SubscriptionId, &Subscription)> {
        let mut subscriptions: Vec<_> = self.subscriptions.iter().collect();
        subscriptions.sort_by_key(|(_, s)| s.order);
        subscriptions
    }

    /// Ids of subscriptions reading any of `namespaces`, in creation order.
    pub(crate) fn touching(&self, namespaces: &BTreeSet<String>) -> Vec<SubscriptionId> {
        let scope = Scope::Namespaces(namespaces.clone());
        self.in_creation_order()
            .into_iter()
            .filter(|(id, s)| scope.covers(id, &s.query))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ignore deltas for these subscriptions until a full patch arrives.
    pub(crate) fn mark_awaiting_full<'a>(&mut self, ids: impl IntoIterator<Item = &'a SubscriptionId>) {
        for id in ids {
            if let Some(subscription) = self.subscriptions.get_mut(id) {
                subscription.awaiting_full = true;
            }
        }
    }

    /// Marks every subscription stale, e.g. after the connection closed.
    pub(crate) fn mark_all_stale(&mut self) {
        for subscription in self.subscriptions.values_mut() {
            subscription.awaiting_full = true;
        }
    }

    /// Applies an inbound patch to a subscription's snapshot.
    pub(crate) fn apply_patch(
        &mut self,
        id: &SubscriptionId,
        version: u64,
        body: &PatchBody,
    ) -> Option<PatchOutcome> {
        let subscription = self.subscriptions.get_mut(id)?;
        let outcome =
            store::apply_patch(&mut subscription.snapshot, subscription.awaiting_full, version, body);
        if outcome == PatchOutcome::Applied && body.is_full() {
            subscription.awaiting_full = false;
        }
        Some(outcome)
    }

    /// Recomputes materialized results and queues deliveries for the ones
    /// that changed. Returns the number of subscriptions that changed.
    pub(crate) fn recompute(
        &mut self,
        scope: &Scope,
        queue: &MutationQueue,
        outbox: &mut Outbox,
    ) -> usize {
        let mut ids: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(id, s)| scope.covers(id, &s.query))
            .map(|(id, s)| (s.order, id.clone()))
            .collect();
        ids.sort();

        let mut changed = 0;
        for (_, id) in ids {
            if let Some(subscription) = self.subscriptions.get_mut(&id) {
                if subscription.recompute(queue, outbox) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Queues the current result for one listener, if there is one.
    pub(crate) fn deliver_current(&self, id: &SubscriptionId, listener: u64, outbox: &mut Outbox) {
        if let Some(subscription) = self.subscriptions.get(id) {
            if let Some(result) = &subscription.last_result {
                subscription.listeners.notify_one(listener, result, outbox);
            }
        }
    }

    /// Current materialized result of a subscription.
    pub(crate) fn materialize(&self, id: &SubscriptionId, queue: &MutationQueue) -> Option<Dataset> {
        let subscription = self.subscriptions.get(id)?;
        store::materialize(subscription.snapshot.as_ref(), &subscription.query, queue.operations())
    }

    /// Drops every subscription and cancels queued deliveries.
    pub(crate) fn clear(&mut self) {
        for subscription in self.subscriptions.values_mut() {
            subscription.listeners.clear();
        }
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use tessera_codec::Value;
    use tessera_protocol::{EntityKey, Operation};

    fn query(shape: serde_json::Value) -> Query {
        Query::parse(&Value::from(shape)).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<Dataset>>>, Callback<Dataset>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |d: &Dataset| sink.lock().push(d.clone())))
    }

    fn run(outbox: &mut Outbox) {
        for delivery in outbox.take() {
            delivery();
        }
    }

    fn full(title: &str) -> PatchBody {
        let mut data = Dataset::new();
        data.put(
            &EntityKey::new("todos", "1"),
            [("title".to_string(), Value::from(title))].into(),
        );
        PatchBody::Full { data }
    }

    #[test]
    fn equivalent_queries_share_a_subscription() {
        let mut registry = SubscriptionRegistry::default();
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();
        let a = registry.add(query(json!({"todos": {}, "users": {}})), cb1, None);
        let b = registry.add(query(json!({"users": {}, "todos": {}})), cb2, None);

        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.id, b.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&a.id).unwrap().ref_count(), 2);

        assert_eq!(registry.remove(&a.id, a.listener), Removal::Remaining(1));
        assert_eq!(registry.remove(&a.id, a.listener), Removal::NotFound);
        assert_eq!(registry.remove(&b.id, b.listener), Removal::Last);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn identical_results_are_suppressed() {
        let mut registry = SubscriptionRegistry::default();
        let queue = MutationQueue::default();
        let (seen, cb) = recorder();
        let reg = registry.add(query(json!({"todos": {}})), cb, None);
        let mut outbox = Outbox::default();

        registry.apply_patch(&reg.id, 1, &full("a"));
        registry.recompute(&Scope::One(reg.id.clone()), &queue, &mut outbox);
        registry.apply_patch(&reg.id, 2, &full("a"));
        assert_eq!(registry.recompute(&Scope::All, &queue, &mut outbox), 0);
        registry.apply_patch(&reg.id, 3, &full("b"));
        registry.recompute(&Scope::All, &queue, &mut outbox);
        run(&mut outbox);

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn scope_filters_by_namespace() {
        let mut registry = SubscriptionRegistry::default();
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();
        let todos = registry.add(query(json!({"todos": {}})), cb1, None);
        let users = registry.add(query(json!({"users": {}})), cb2, None);

        let touched = registry.touching(&["todos".to_string()].into());
        assert_eq!(touched, vec![todos.id.clone()]);

        let order: Vec<_> = registry
            .in_creation_order()
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(order, vec![todos.id, users.id]);
    }

    #[test]
    fn deltas_wait_for_full_after_stale() {
        let mut registry = SubscriptionRegistry::default();
        let (_, cb) = recorder();
        let reg = registry.add(query(json!({"todos": {}})), cb, None);
        let delta = PatchBody::Delta {
            upserts: Vec::new(),
            deletes: vec![EntityKey::new("todos", "1")],
        };

        assert_eq!(registry.apply_patch(&reg.id, 1, &full("a")), Some(PatchOutcome::Applied));
        assert_eq!(registry.apply_patch(&reg.id, 2, &delta), Some(PatchOutcome::Applied));

        registry.mark_all_stale();
        assert_eq!(
            registry.apply_patch(&reg.id, 3, &delta),
            Some(PatchOutcome::AwaitingFull)
        );
        assert_eq!(registry.apply_patch(&reg.id, 4, &full("b")), Some(PatchOutcome::Applied));
        assert_eq!(registry.apply_patch(&reg.id, 5, &delta), Some(PatchOutcome::Applied));
    }

    #[test]
    fn pending_writes_overlay_results() {
        let mut registry = SubscriptionRegistry::default();
        let mut queue = MutationQueue::default();
        let (seen, cb) = recorder();
        let reg = registry.add(query(json!({"todos": {}})), cb, None);
        registry.apply_patch(&reg.id, 1, &full("server"));

        let _s = queue.enqueue(vec![Operation::update(
            "todos",
            "1",
            [("title".to_string(), Value::from("local"))].into(),
        )]);
        let mut outbox = Outbox::default();
        registry.recompute(&Scope::All, &queue, &mut outbox);
        run(&mut outbox);

        let seen = seen.lock();
        let title = seen[0].get(&EntityKey::new("todos", "1")).unwrap().get("title");
        assert_eq!(title, Some(&Value::from("local")));
    }
}
