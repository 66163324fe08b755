//! Single-threaded notification streams.
//!
//! Everything in the tracker runs on one cooperative timeline, so listeners
//! are plain `Rc` callbacks rather than channels. Firing takes a snapshot of
//! the listener list first, which lets a listener subscribe, unsubscribe or
//! fire other emitters from inside its callback.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Listener<T> = Rc<dyn Fn(&T)>;

struct Registry<T> {
    listeners: RefCell<Vec<(u64, Listener<T>)>>,
    next_id: Cell<u64>,
    closed: Cell<bool>,
}

pub struct Emitter<T> {
    registry: Rc<Registry<T>>,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(Registry {
                listeners: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                closed: Cell::new(false),
            }),
        }
    }

    /// Registers `listener`. Subscribing to a closed emitter returns an inert
    /// subscription and the listener is never called.
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        if self.registry.closed.get() {
            return Subscription::inert();
        }
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);
        self.registry
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let weak: Weak<Registry<T>> = Rc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .listeners
                        .borrow_mut()
                        .retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    pub fn fire(&self, value: &T) {
        if self.registry.closed.get() {
            return;
        }
        let snapshot: Vec<Listener<T>> = self
            .registry
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    /// Drops every listener and rejects future subscriptions and fires.
    pub fn close(&self) {
        self.registry.closed.set(true);
        self.registry.listeners.borrow_mut().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.get()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners.borrow().len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
        }
    }
}

/// Handle for one registered listener. Detaches on `dispose` or drop.
#[must_use = "dropping a subscription detaches its listener"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn inert() -> Self {
        Self { detach: None }
    }

    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_reaches_every_listener_in_order() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&seen);
        let _a = emitter.subscribe(move |v| first.borrow_mut().push(("a", *v)));
        let second = Rc::clone(&seen);
        let _b = emitter.subscribe(move |v| second.borrow_mut().push(("b", *v)));

        emitter.fire(&7);
        assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn disposed_subscription_stops_receiving() {
        let emitter: Emitter<u32> = Emitter::new();
        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        let mut sub = emitter.subscribe(move |_| counter.set(counter.get() + 1));

        emitter.fire(&1);
        sub.dispose();
        emitter.fire(&2);

        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn closed_emitter_ignores_fire_and_subscribe() {
        let emitter: Emitter<u32> = Emitter::new();
        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        let _sub = emitter.subscribe(move |_| counter.set(counter.get() + 1));

        emitter.close();
        emitter.fire(&1);
        let late = Rc::clone(&count);
        let _late = emitter.subscribe(move |_| late.set(late.get() + 10));
        emitter.fire(&2);

        assert_eq!(count.get(), 0);
        assert!(emitter.is_closed());
    }

    #[test]
    fn listener_may_fire_another_emitter() {
        let upstream: Emitter<u32> = Emitter::new();
        let downstream: Emitter<u32> = Emitter::new();
        let seen = Rc::new(Cell::new(0));

        let relay = downstream.clone();
        let _up = upstream.subscribe(move |v| relay.fire(&(v * 2)));
        let sink = Rc::clone(&seen);
        let _down = downstream.subscribe(move |v| sink.set(*v));

        upstream.fire(&21);
        assert_eq!(seen.get(), 42);
    }
}
