//! Routing of inbound frames to handlers by message type.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use beacon_shared::{Envelope, InboundMessage};

use crate::handlers::{HandlerSet, Subscription};

struct DispatcherInner {
    debug: bool,
    routes: RefCell<HashMap<String, Rc<HandlerSet<InboundMessage>>>>,
    any: HandlerSet<InboundMessage>,
}

/// Fan-out of inbound messages.
///
/// Handlers return `anyhow::Result<()>`; an error or a panic is logged and
/// isolated to that handler. Cloning yields another handle to the same
/// routing table.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Rc<DispatcherInner>,
}

impl MessageDispatcher {
    pub fn new(debug: bool) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                debug,
                routes: RefCell::new(HashMap::new()),
                any: HandlerSet::new("message"),
            }),
        }
    }

    /// Register `handler` for messages of type `kind`.
    pub fn on(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(&InboundMessage) -> anyhow::Result<()> + 'static,
    ) -> Subscription {
        let kind = kind.into();
        let set = self
            .inner
            .routes
            .borrow_mut()
            .entry(kind.clone())
            .or_insert_with(|| Rc::new(HandlerSet::new("message")))
            .clone();

        let label = kind.clone();
        let registration = set.insert(move |message: &InboundMessage| {
            if let Err(e) = handler(message) {
                crate::log_warn!("Handler for '{}' failed: {:#}", label, e);
            }
        });

        // Forget the message type once its last handler is gone.
        let inner = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            registration.unsubscribe();
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut routes = inner.routes.borrow_mut();
            if routes.get(&kind).is_some_and(|set| set.is_empty()) {
                routes.remove(&kind);
            }
        })
    }

    /// Register `handler` for every message, after the type-specific ones.
    pub fn on_any(
        &self,
        handler: impl Fn(&InboundMessage) -> anyhow::Result<()> + 'static,
    ) -> Subscription {
        self.inner.any.insert(move |message: &InboundMessage| {
            if let Err(e) = handler(message) {
                crate::log_warn!("Catch-all handler failed on '{}': {:#}", message.kind, e);
            }
        })
    }

    /// Decode one text frame and route it. Malformed frames are logged and
    /// dropped. Returns how many handlers completed.
    pub fn dispatch_text(&self, frame: &str) -> usize {
        match Envelope::decode(frame) {
            Ok(message) => self.dispatch(&message),
            Err(e) => {
                crate::log_warn!("Dropping malformed frame: {}", e);
                crate::trace_debug!(self.inner.debug, "malformed frame: {}", frame);
                0
            }
        }
    }

    /// Route a decoded message to its handlers, in registration order.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let set = self.inner.routes.borrow().get(&message.kind).cloned();

        let mut completed = match set {
            Some(set) if !set.is_empty() => set.emit(message),
            _ => {
                crate::trace_debug!(
                    self.inner.debug,
                    "No handler for message type '{}'",
                    message.kind
                );
                0
            }
        };
        completed += self.inner.any.emit(message);
        completed
    }

    /// Handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: &str) -> usize {
        self.inner
            .routes
            .borrow()
            .get(kind)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Drop every handler; outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        let sets: Vec<_> = self.inner.routes.borrow_mut().drain().map(|(_, set)| set).collect();
        for set in sets {
            set.clear();
        }
        self.inner.any.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, impl Fn(&InboundMessage) -> anyhow::Result<()>) {
        let count = Rc::new(Cell::new(0));
        let count_in = count.clone();
        (count, move |_: &InboundMessage| {
            count_in.set(count_in.get() + 1);
            Ok(())
        })
    }

    #[test]
    fn routes_by_type() {
        let dispatcher = MessageDispatcher::new(false);
        let (alerts, on_alert) = counter();
        let (kpis, on_kpi) = counter();
        let _a = dispatcher.on("alert", on_alert);
        let _k = dispatcher.on("kpi", on_kpi);

        dispatcher.dispatch_text(r#"{"type":"kpi","payload":{"value":1}}"#);
        dispatcher.dispatch_text(r#"{"type":"kpi"}"#);
        dispatcher.dispatch_text(r#"{"type":"alert"}"#);

        assert_eq!(kpis.get(), 2);
        assert_eq!(alerts.get(), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let dispatcher = MessageDispatcher::new(false);
        let _x_fails = dispatcher.on("x", |_| bail!("bad payload"));
        let _x_panics = dispatcher.on("x", |_| panic!("handler bug"));
        let (x_ok, on_x) = counter();
        let _x_ok = dispatcher.on("x", on_x);
        let (y, on_y) = counter();
        let _y = dispatcher.on("y", on_y);

        dispatcher.dispatch(&Envelope::new("x", json!(1)));
        dispatcher.dispatch(&Envelope::new("y", json!(2)));

        assert_eq!(x_ok.get(), 1);
        assert_eq!(y.get(), 1);
    }

    #[test]
    fn unknown_and_malformed_frames_are_dropped() {
        let dispatcher = MessageDispatcher::new(true);
        let (hits, on_hit) = counter();
        let _sub = dispatcher.on("known", on_hit);

        assert_eq!(dispatcher.dispatch_text(r#"{"type":"unknown"}"#), 0);
        assert_eq!(dispatcher.dispatch_text("{not json"), 0);
        assert_eq!(dispatcher.dispatch_text(r#"{"type":""}"#), 0);
        assert_eq!(dispatcher.dispatch_text(r#"{"type":"known"}"#), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery_permanently() {
        let dispatcher = MessageDispatcher::new(false);
        let (hits, on_hit) = counter();
        let sub = dispatcher.on("tick", on_hit);

        dispatcher.dispatch(&Envelope::new("tick", json!(null)));
        sub.unsubscribe();
        sub.unsubscribe();
        dispatcher.dispatch(&Envelope::new("tick", json!(null)));
        let _other = dispatcher.on("tick", |_| Ok(()));
        dispatcher.dispatch(&Envelope::new("tick", json!(null)));

        assert_eq!(hits.get(), 1);
        assert_eq!(dispatcher.handler_count("tick"), 1);
    }

    #[test]
    fn handler_can_register_and_release_during_dispatch() {
        let dispatcher = MessageDispatcher::new(false);
        let late_hits = Rc::new(Cell::new(0));
        let slot: Rc<RefCell<Vec<Subscription>>> = Rc::new(RefCell::new(Vec::new()));

        let dispatcher_in = dispatcher.clone();
        let late_in = late_hits.clone();
        let slot_in = slot.clone();
        let registrar = dispatcher.on("tick", move |_| {
            let late = late_in.clone();
            let sub = dispatcher_in.on("tick", move |_| {
                late.set(late.get() + 1);
                Ok(())
            });
            slot_in.borrow_mut().push(sub);
            Ok(())
        });

        dispatcher.dispatch(&Envelope::new("tick", json!(null)));
        assert_eq!(late_hits.get(), 0);

        registrar.unsubscribe();
        dispatcher.dispatch(&Envelope::new("tick", json!(null)));
        assert_eq!(late_hits.get(), 1);
        assert_eq!(dispatcher.handler_count("tick"), 1);
    }

    #[test]
    fn releasing_the_last_handler_forgets_the_type() {
        let dispatcher = MessageDispatcher::new(false);
        let first = dispatcher.on("progress", |_| Ok(()));
        let second = dispatcher.on("progress", |_| Ok(()));
        let _kept = dispatcher.on("kpi", |_| Ok(()));

        first.unsubscribe();
        assert_eq!(dispatcher.inner.routes.borrow().len(), 2);

        second.unsubscribe();
        second.unsubscribe();
        assert_eq!(dispatcher.handler_count("progress"), 0);
        assert_eq!(dispatcher.inner.routes.borrow().len(), 1);

        let (hits, on_hit) = counter();
        let _again = dispatcher.on("progress", on_hit);
        dispatcher.dispatch(&Envelope::new("progress", json!(1)));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn handler_releasing_itself_during_dispatch_is_pruned() {
        let dispatcher = MessageDispatcher::new(false);
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let slot_in = slot.clone();
        let sub = dispatcher.on("once", move |_| {
            if let Some(sub) = slot_in.borrow().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(sub);

        assert_eq!(dispatcher.dispatch(&Envelope::new("once", json!(null))), 1);
        assert_eq!(dispatcher.dispatch(&Envelope::new("once", json!(null))), 0);
        assert!(dispatcher.inner.routes.borrow().is_empty());
    }

    #[test]
    fn catch_all_sees_every_message() {
        let dispatcher = MessageDispatcher::new(false);
        let kinds = Rc::new(RefCell::new(Vec::new()));
        let kinds_in = kinds.clone();
        let _all = dispatcher.on_any(move |msg| {
            kinds_in.borrow_mut().push(msg.kind.clone());
            Ok(())
        });

        dispatcher.dispatch_text(r#"{"type":"a"}"#);
        dispatcher.dispatch_text(r#"{"type":"b","channel":"general"}"#);

        assert_eq!(*kinds.borrow(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn clear_releases_everything() {
        let dispatcher = MessageDispatcher::new(false);
        let (hits, on_hit) = counter();
        let sub = dispatcher.on("tick", on_hit);

        dispatcher.clear();
        dispatcher.dispatch(&Envelope::new("tick", json!(null)));
        sub.unsubscribe();

        assert_eq!(hits.get(), 0);
        assert_eq!(dispatcher.handler_count("tick"), 0);
    }
}
