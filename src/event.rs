//! Typed publish/subscribe channel used by every stateful entity.
//!
//! Entities hold an `EventChannel` by composition and delegate to it rather
//! than inheriting observer behavior. Delivery is either synchronous
//! (`emit`) or deferred into a coalescing queue (`defer` + `flush`) for
//! callers that batch visual refreshes.

use std::cell::RefCell;
use std::rc::Rc;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback<E> = Rc<dyn Fn(&E)>;

struct Inner<E> {
    subscribers: Vec<(SubscriberId, Callback<E>)>,
    queue: Vec<E>,
    next_id: u64,
}

/// A single-threaded event channel with subscriber management.
pub struct EventChannel<E> {
    inner: RefCell<Inner<E>>,
}

impl<E> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                subscribers: Vec::new(),
                queue: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a callback, returning an id for later removal.
    pub fn subscribe(&self, callback: impl Fn(&E) + 'static) -> SubscriberId {
        let mut inner = self.inner.borrow_mut();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, Rc::new(callback)));
        id
    }

    /// Remove a subscriber. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    /// Deliver an event synchronously to all current subscribers.
    ///
    /// Callbacks are cloned out before invocation so a subscriber may
    /// subscribe or unsubscribe from within its own callback.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let inner = self.inner.borrow();
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Number of events currently queued for deferred delivery.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}

impl<E: PartialEq> EventChannel<E> {
    /// Queue an event for later delivery. An event equal to one already
    /// queued is coalesced away.
    pub fn defer(&self, event: E) {
        let mut inner = self.inner.borrow_mut();
        if !inner.queue.contains(&event) {
            inner.queue.push(event);
        }
    }

    /// Deliver and drain all queued events in queue order.
    pub fn flush(&self) {
        let drained: Vec<E> = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.queue)
        };
        for event in &drained {
            self.emit(event);
        }
    }
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}
