//! Event dispatch.
//!
//! A small string-keyed publish/subscribe table decoupling message
//! arrival from handling. Handlers run synchronously on the calling
//! thread, in registration order. A handler that panics is reported and
//! isolated; the remaining handlers for the event still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use tracing::error;

/// Ticket returned by [`Dispatcher::on`], used to deregister.
///
/// Closures have no comparable identity in Rust, so removal goes through
/// the ticket instead of the handler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Box<dyn FnMut(&Value)>;

/// Ordered publish/subscribe table keyed by event-type string.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind`. Invocation order is registration
    /// order; multiple handlers per kind are allowed.
    pub fn on(&mut self, kind: &str, handler: impl FnMut(&Value) + 'static) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers
            .entry(kind.to_string())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Deregisters a handler. Returns false if it was not registered
    /// under `kind` (or was already removed).
    pub fn off(&mut self, kind: &str, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        list.len() != before
    }

    /// Invokes every handler registered for `kind`, in order. Each
    /// invocation is isolated: a panic is logged and does not reach the
    /// caller or the remaining handlers.
    pub fn trigger(&mut self, kind: &str, payload: &Value) {
        let Some(list) = self.handlers.get_mut(kind) else {
            return;
        };
        for (id, handler) in list.iter_mut() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!(kind, handler = id.0, "event handler panicked");
            }
        }
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn handlers_run_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Dispatcher::new();
        for i in 0..3 {
            let seen = seen.clone();
            bus.on("state", move |_| seen.borrow_mut().push(i));
        }
        bus.trigger("state", &Value::Null);
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn off_removes_only_the_given_handler() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Dispatcher::new();
        let s1 = seen.clone();
        let first = bus.on("chat", move |_| s1.borrow_mut().push("first"));
        let s2 = seen.clone();
        bus.on("chat", move |_| s2.borrow_mut().push("second"));

        assert!(bus.off("chat", first));
        assert!(!bus.off("chat", first));
        bus.trigger("chat", &Value::Null);
        assert_eq!(*seen.borrow(), vec!["second"]);
    }

    #[test]
    fn kinds_are_independent() {
        let count = Rc::new(RefCell::new(0));
        let mut bus = Dispatcher::new();
        let c = count.clone();
        bus.on("welcome", move |_| *c.borrow_mut() += 1);
        bus.trigger("state", &Value::Null);
        assert_eq!(*count.borrow(), 0);
        bus.trigger("welcome", &Value::Null);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_siblings() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = Dispatcher::new();
        let s1 = seen.clone();
        bus.on("state", move |_| {
            s1.borrow_mut().push("before");
            panic!("handler bug");
        });
        let s2 = seen.clone();
        bus.on("state", move |_| s2.borrow_mut().push("after"));

        bus.trigger("state", &Value::Null);
        assert_eq!(*seen.borrow(), vec!["before", "after"]);

        // Dispatcher state survives the fault.
        bus.trigger("state", &Value::Null);
        assert_eq!(seen.borrow().len(), 4);
    }

    #[test]
    fn payload_reaches_handlers() {
        let got = Rc::new(RefCell::new(Value::Null));
        let mut bus = Dispatcher::new();
        let g = got.clone();
        bus.on("error", move |v| *g.borrow_mut() = v.clone());
        bus.trigger("error", &serde_json::json!({ "message": "room full" }));
        assert_eq!(got.borrow()["message"], "room full");
    }
}
