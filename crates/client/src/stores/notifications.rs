//! Notification store fed by the `notification` message type.
//!
//! The collection is newest-first and keeps ids unique. Read state only ever
//! changes locally; the unread count is derived on every call.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use beacon_shared::{Notification, NotificationPayload, TYPE_NOTIFICATION};
use chrono::Utc;

use crate::alerts::{Alert, AlertSink};
use crate::dispatch::MessageDispatcher;
use crate::handlers::{HandlerSet, Subscription};

struct AggregatorInner {
    items: RefCell<Vec<Notification>>,
    alerts: Box<dyn AlertSink>,
    observers: HandlerSet<[Notification]>,
    registration: RefCell<Option<Subscription>>,
}

impl Drop for AggregatorInner {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.get_mut().take() {
            registration.unsubscribe();
        }
    }
}

#[derive(Clone)]
pub struct NotificationAggregator {
    inner: Rc<AggregatorInner>,
}

impl NotificationAggregator {
    /// Create the store and register it for `notification` messages on
    /// `dispatcher`. The registration lives as long as the store.
    pub fn new(dispatcher: &MessageDispatcher, alerts: impl AlertSink + 'static) -> Self {
        let inner = Rc::new(AggregatorInner {
            items: RefCell::new(Vec::new()),
            alerts: Box::new(alerts),
            observers: HandlerSet::new("notification store"),
            registration: RefCell::new(None),
        });

        let weak: Weak<AggregatorInner> = Rc::downgrade(&inner);
        let registration = dispatcher.on(TYPE_NOTIFICATION, move |message| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let payload = NotificationPayload::from_envelope(message)?;
            NotificationAggregator { inner }.receive(payload.into_notification(Utc::now()));
            Ok(())
        });
        *inner.registration.borrow_mut() = Some(registration);

        Self { inner }
    }

    /// Add a notification at the front and raise its alert. Returns false,
    /// changing nothing, when the id is already present.
    pub fn receive(&self, mut notification: Notification) -> bool {
        notification.read = false;
        {
            let mut items = self.inner.items.borrow_mut();
            if items.iter().any(|n| n.id == notification.id) {
                crate::log_debug!("Ignoring duplicate notification {}", notification.id);
                return false;
            }
            items.insert(0, notification.clone());
        }

        self.changed();
        self.inner.alerts.show(&Alert::from_notification(&notification));
        true
    }

    /// Snapshot of the collection, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.items.borrow().clone()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.items.borrow().iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    /// Mark one notification read. Returns false if the id is unknown or it
    /// was already read.
    pub fn mark_as_read(&self, id: &str) -> bool {
        let updated = {
            let mut items = self.inner.items.borrow_mut();
            match items.iter_mut().find(|n| n.id == id) {
                Some(n) if !n.read => {
                    n.read = true;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.changed();
        }
        updated
    }

    /// Mark everything read. Returns how many notifications changed.
    pub fn mark_all_as_read(&self) -> usize {
        let updated = {
            let mut items = self.inner.items.borrow_mut();
            let mut updated = 0;
            for n in items.iter_mut().filter(|n| !n.read) {
                n.read = true;
                updated += 1;
            }
            updated
        };
        if updated > 0 {
            self.changed();
        }
        updated
    }

    pub fn clear(&self) {
        let had_items = !std::mem::take(&mut *self.inner.items.borrow_mut()).is_empty();
        if had_items {
            self.changed();
        }
    }

    /// Observe the collection after every change.
    pub fn on_change(&self, callback: impl Fn(&[Notification]) + 'static) -> Subscription {
        self.inner.observers.insert(callback)
    }

    fn changed(&self) {
        let snapshot = self.notifications();
        self.inner.observers.emit(snapshot.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_shared::{Envelope, NotificationKind};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use std::cell::Cell;

    fn store() -> (MessageDispatcher, NotificationAggregator, Rc<RefCell<Vec<Alert>>>) {
        let dispatcher = MessageDispatcher::new(false);
        let alerts = Rc::new(RefCell::new(Vec::new()));
        let alerts_in = alerts.clone();
        let store = NotificationAggregator::new(&dispatcher, move |alert: &Alert| {
            alerts_in.borrow_mut().push(alert.clone());
        });
        (dispatcher, store, alerts)
    }

    fn push(dispatcher: &MessageDispatcher, payload: serde_json::Value) {
        dispatcher.dispatch(&Envelope::new(TYPE_NOTIFICATION, payload));
    }

    fn ids(store: &NotificationAggregator) -> Vec<String> {
        store.notifications().into_iter().map(|n| n.id).collect()
    }

    #[test]
    fn newest_first_and_unread() {
        let (dispatcher, store, alerts) = store();
        push(&dispatcher, json!({ "id": "a", "message": "first", "read": true }));
        push(&dispatcher, json!({ "id": "b", "type": "warning", "message": "second" }));

        assert_eq!(ids(&store), vec!["b", "a"]);
        assert_eq!(store.unread_count(), 2);
        assert_eq!(store.notifications()[0].kind, NotificationKind::Warning);

        let alerts = alerts.borrow();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].message, "second");
    }

    #[test]
    fn defaults_are_filled_in() {
        let (dispatcher, store, _alerts) = store();
        let before = Utc::now();
        push(&dispatcher, json!({ "message": "no id, no time" }));

        let n = &store.notifications()[0];
        assert_eq!(n.id.len(), 36);
        assert_eq!(n.kind, NotificationKind::Info);
        assert!(n.timestamp >= before);

        push(
            &dispatcher,
            json!({ "id": "t", "message": "x", "timestamp": "2024-03-01T12:00:00Z" }),
        );
        assert_eq!(
            store.notifications()[0].timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn bad_payloads_are_dropped() {
        let (dispatcher, store, alerts) = store();
        push(&dispatcher, json!({ "title": "missing message" }));
        push(&dispatcher, json!({ "message": "x", "type": "catastrophe" }));
        push(&dispatcher, json!("not an object"));

        assert!(store.is_empty());
        assert!(alerts.borrow().is_empty());
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let (dispatcher, store, alerts) = store();
        push(&dispatcher, json!({ "id": "same", "message": "one" }));
        store.mark_as_read("same");
        push(&dispatcher, json!({ "id": "same", "message": "two" }));

        assert_eq!(store.len(), 1);
        assert_eq!(store.notifications()[0].message, "one");
        assert_eq!(store.unread_count(), 0);
        assert_eq!(alerts.borrow().len(), 1);
    }

    #[test]
    fn mark_as_read_and_clear() {
        let (dispatcher, store, _alerts) = store();
        for id in ["a", "b", "c"] {
            push(&dispatcher, json!({ "id": id, "message": id }));
        }

        assert!(store.mark_as_read("b"));
        assert!(!store.mark_as_read("b"));
        assert!(!store.mark_as_read("nope"));
        assert_eq!(store.unread_count(), 2);

        assert_eq!(store.mark_all_as_read(), 2);
        assert_eq!(store.mark_all_as_read(), 0);
        assert_eq!(store.unread_count(), 0);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn observers_follow_every_change() {
        let (dispatcher, store, _alerts) = store();
        let unread = Rc::new(RefCell::new(Vec::new()));
        let unread_in = unread.clone();
        let sub = store.on_change(move |items| {
            unread_in
                .borrow_mut()
                .push(items.iter().filter(|n| !n.read).count());
        });

        push(&dispatcher, json!({ "id": "a", "message": "a" }));
        push(&dispatcher, json!({ "id": "b", "message": "b" }));
        store.mark_as_read("a");
        store.mark_as_read("missing");
        store.clear();
        sub.unsubscribe();
        push(&dispatcher, json!({ "id": "c", "message": "c" }));

        assert_eq!(*unread.borrow(), vec![1, 2, 1, 0]);
    }

    #[test]
    fn observer_may_mutate_the_store() {
        let (dispatcher, store, _alerts) = store();
        let calls = Rc::new(Cell::new(0));
        let calls_in = calls.clone();
        let handle = store.clone();
        let _sub = store.on_change(move |items| {
            calls_in.set(calls_in.get() + 1);
            if let Some(first) = items.first().filter(|n| !n.read) {
                handle.mark_as_read(&first.id);
            }
        });

        push(&dispatcher, json!({ "id": "a", "message": "auto-read" }));
        assert_eq!(store.unread_count(), 0);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn dropping_the_store_unregisters_it() {
        let (dispatcher, store, alerts) = store();
        assert_eq!(dispatcher.handler_count(TYPE_NOTIFICATION), 1);
        drop(store);

        assert_eq!(dispatcher.handler_count(TYPE_NOTIFICATION), 0);
        push(&dispatcher, json!({ "message": "nobody home" }));
        assert!(alerts.borrow().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(u8),
        MarkRead(u8),
        MarkAll,
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..6).prop_map(Op::Receive),
            3 => (0u8..6).prop_map(Op::MarkRead),
            1 => Just(Op::MarkAll),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn unread_count_matches_collection(ops in proptest::collection::vec(op(), 0..40)) {
            let (dispatcher, store, _alerts) = store();
            let mut model: Vec<(String, bool)> = Vec::new();

            for op in ops {
                match op {
                    Op::Receive(id) => {
                        let id = id.to_string();
                        push(&dispatcher, json!({ "id": id, "message": "m" }));
                        if !model.iter().any(|(known, _)| *known == id) {
                            model.insert(0, (id, false));
                        }
                    }
                    Op::MarkRead(id) => {
                        let id = id.to_string();
                        store.mark_as_read(&id);
                        if let Some(entry) = model.iter_mut().find(|(known, _)| *known == id) {
                            entry.1 = true;
                        }
                    }
                    Op::MarkAll => {
                        store.mark_all_as_read();
                        model.iter_mut().for_each(|entry| entry.1 = true);
                    }
                    Op::Clear => {
                        store.clear();
                        model.clear();
                    }
                }

                let unread = model.iter().filter(|(_, read)| !read).count();
                prop_assert_eq!(store.unread_count(), unread);
                prop_assert_eq!(
                    ids(&store),
                    model.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>()
                );
            }
        }
    }
}
