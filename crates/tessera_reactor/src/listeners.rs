//! Listener sets and the deferred delivery outbox.
//!
//! State transitions never call user code directly. They queue deliveries in
//! an [`Outbox`]; the reactor runs them after releasing its lock, in the
//! order they were queued. Each listener carries an `active` flag shared with
//! its unsubscribe handle, so a delivery queued before an unsubscribe is
//! skipped if it has not run yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A callback invoked with a shared value.
pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A deferred callback invocation.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// Ordered deliveries produced by one state transition.
#[derive(Default)]
pub(crate) struct Outbox {
    deliveries: Vec<Delivery>,
}

impl Outbox {
    pub(crate) fn push(&mut self, delivery: Delivery) {
        self.deliveries.push(delivery);
    }

    pub(crate) fn take(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

struct Listener<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

/// Registered callbacks for one kind of event, in registration order.
pub(crate) struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<Listener<T>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<T: Send + Sync + 'static> ListenerSet<T> {
    /// Registers a callback. Returns its id and active flag.
    pub(crate) fn add(&mut self, callback: Callback<T>) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id;
        self.next_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        self.entries.push(Listener {
            id,
            active: Arc::clone(&active),
            callback,
        });
        (id, active)
    }

    /// Removes a callback. Returns false if it was not registered.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let Some(index) = self.entries.iter().position(|l| l.id == id) else {
            return false;
        };
        let listener = self.entries.remove(index);
        listener.active.store(false, Ordering::SeqCst);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every callback and cancels their queued deliveries.
    pub(crate) fn clear(&mut self) {
        for listener in self.entries.drain(..) {
            listener.active.store(false, Ordering::SeqCst);
        }
    }

    /// Queues `value` for every callback.
    pub(crate) fn notify_all(&self, value: &Arc<T>, outbox: &mut Outbox) {
        for listener in &self.entries {
            outbox.push(Self::delivery(listener, value));
        }
    }

    /// Queues `value` for one callback.
    pub(crate) fn notify_one(&self, id: u64, value: &Arc<T>, outbox: &mut Outbox) {
        if let Some(listener) = self.entries.iter().find(|l| l.id == id) {
            outbox.push(Self::delivery(listener, value));
        }
    }

    fn delivery(listener: &Listener<T>, value: &Arc<T>) -> Delivery {
        let active = Arc::clone(&listener.active);
        let callback = Arc::clone(&listener.callback);
        let value = Arc::clone(value);
        Box::new(move || {
            if active.load(Ordering::SeqCst) {
                callback(value.as_ref());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Callback<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |v: &u32| sink.lock().push(*v)))
    }

    fn run(outbox: &mut Outbox) {
        for delivery in outbox.take() {
            delivery();
        }
    }

    #[test]
    fn deliveries_run_in_order() {
        let (seen, callback) = recorder();
        let mut set = ListenerSet::default();
        set.add(callback);
        let mut outbox = Outbox::default();
        set.notify_all(&Arc::new(1), &mut outbox);
        set.notify_all(&Arc::new(2), &mut outbox);
        run(&mut outbox);
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn removal_cancels_queued_deliveries() {
        let (seen, callback) = recorder();
        let mut set = ListenerSet::default();
        let (id, active) = set.add(callback);
        let mut outbox = Outbox::default();
        set.notify_all(&Arc::new(1), &mut outbox);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(!active.load(Ordering::SeqCst));
        run(&mut outbox);
        assert!(seen.lock().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn notify_one_targets_a_single_listener() {
        let (first, cb1) = recorder();
        let (second, cb2) = recorder();
        let mut set = ListenerSet::default();
        set.add(cb1);
        let (id, _) = set.add(cb2);
        let mut outbox = Outbox::default();
        set.notify_one(id, &Arc::new(7), &mut outbox);
        run(&mut outbox);
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec![7]);
        assert_eq!(set.len(), 2);
    }
}
