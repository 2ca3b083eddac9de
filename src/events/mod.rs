//! # Event bus
//!
//! Per-object publish/subscribe used by every stateful component
//! (SPEC_FULL.md §4.3). Handlers return `Result<()>` instead of relying on
//! exception trapping: a JS `EventEmitter` catches a thrown exception from
//! a handler, but a Rust closure can't throw, and the teacher's wasm
//! release profile builds with `panic = "abort"`, which rules out
//! `catch_unwind` as a substitute. Returning `Err` and logging it via
//! `tracing::error!` satisfies the same "never abort delivery to other
//! subscribers" invariant through an idiomatic contract instead.

use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type Handler<E> = Rc<dyn Fn(&E) -> Result<()>>;

struct Subscription<E> {
    id: u64,
    once: bool,
    handler: Handler<E>,
}

/// A typed, single-event-type publish/subscribe bus.
///
/// One `EventBus<Event>` is shared (via `Rc`) by every component that needs
/// to observe or emit the crate's public events.
pub struct EventBus<E> {
    subscribers: RefCell<HashMap<u64, Subscription<E>>>,
    order: RefCell<Vec<u64>>,
    next_id: RefCell<u64>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        EventBus {
            subscribers: RefCell::new(HashMap::new()),
            order: RefCell::new(Vec::new()),
            next_id: RefCell::new(0),
        }
    }
}

/// An unsubscribe token returned by `on`/`once`.
pub struct Subscriber<E> {
    bus: Rc<EventBus<E>>,
    id: u64,
}

impl<E> Subscriber<E> {
    pub fn unsubscribe(self) {
        self.bus.remove_subscription(self.id);
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn insert(self: &Rc<Self>, once: bool, handler: Handler<E>) -> Subscriber<E> {
        let id = {
            let mut next = self.next_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.subscribers.borrow_mut().insert(id, Subscription { id, once, handler });
        self.order.borrow_mut().push(id);
        Subscriber { bus: self.clone(), id }
    }

    /// Subscribe for every future emission. Returns a token that
    /// unsubscribes on `.unsubscribe()`.
    pub fn on(self: &Rc<Self>, handler: impl Fn(&E) -> Result<()> + 'static) -> Subscriber<E> {
        self.insert(false, Rc::new(handler))
    }

    /// Subscribe for exactly one emission.
    pub fn once(self: &Rc<Self>, handler: impl Fn(&E) -> Result<()> + 'static) -> Subscriber<E> {
        self.insert(true, Rc::new(handler))
    }

    /// Remove every subscriber whose handler pointer matches the given
    /// handler. Prefer holding onto the `Subscriber` token and calling
    /// `unsubscribe()` instead — this mirrors the JS `off(event, fn)` shape
    /// for completeness but relies on pointer identity.
    fn remove_subscription(&self, id: u64) {
        self.subscribers.borrow_mut().remove(&id);
        self.order.borrow_mut().retain(|existing| *existing != id);
    }

    pub fn remove_all_listeners(&self) {
        self.subscribers.borrow_mut().clear();
        self.order.borrow_mut().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// Dispatch `event` to a snapshot of current subscribers. A handler
    /// that subscribes or unsubscribes during dispatch does not affect the
    /// current emission (invariant in SPEC_FULL.md §4.3).
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<u64> = self.order.borrow().clone();
        let mut to_remove = Vec::new();
        for id in snapshot {
            let handler_and_once = self.subscribers.borrow().get(&id).map(|s| (s.handler.clone(), s.once));
            let Some((handler, once)) = handler_and_once else { continue };
            if let Err(err) = handler(event) {
                tracing::error!(error = %err, "event handler failed; continuing dispatch");
            }
            if once {
                to_remove.push(id);
            }
        }
        for id in to_remove {
            self.remove_subscription(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn on_receives_every_emission() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let _sub = bus.on(move |_| {
            count2.set(count2.get() + 1);
            Ok(())
        });
        bus.emit(&1);
        bus.emit(&2);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn once_fires_exactly_one_time() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        bus.once(move |_| {
            count2.set(count2.get() + 1);
            Ok(())
        });
        bus.emit(&1);
        bus.emit(&2);
        assert_eq!(count.get(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let sub = bus.on(move |_| {
            count2.set(count2.get() + 1);
            Ok(())
        });
        bus.emit(&1);
        sub.unsubscribe();
        bus.emit(&2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn handler_error_does_not_stop_delivery_to_others() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        let second_ran = Rc::new(Cell::new(false));
        let second_ran2 = second_ran.clone();
        bus.on(|_| Err(crate::error::Error::Other("boom".into())));
        bus.on(move |_| {
            second_ran2.set(true);
            Ok(())
        });
        bus.emit(&1);
        assert!(second_ran.get());
    }

    #[test]
    fn subscribing_during_dispatch_does_not_affect_current_emission() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        let late_count = Rc::new(Cell::new(0));
        let late_count2 = late_count.clone();
        let bus2 = bus.clone();
        bus.on(move |_| {
            let late_count3 = late_count2.clone();
            bus2.on(move |_| {
                late_count3.set(late_count3.get() + 1);
                Ok(())
            });
            Ok(())
        });
        bus.emit(&1);
        assert_eq!(late_count.get(), 0, "subscriber added mid-dispatch must not see this emission");
        bus.emit(&2);
        assert_eq!(late_count.get(), 1);
    }

    #[test]
    fn remove_all_listeners_clears_everything() {
        let bus: Rc<EventBus<i32>> = EventBus::new();
        bus.on(|_| Ok(()));
        bus.on(|_| Ok(()));
        assert_eq!(bus.listener_count(), 2);
        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(), 0);
    }
}
