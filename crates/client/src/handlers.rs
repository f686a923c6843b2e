//! Callback registries and the [`Subscription`] capability they hand out.
//!
//! Every callback list in the crate (status observers, message handlers,
//! store observers) is a [`HandlerSet`]. Emission works on a snapshot of the
//! list, so callbacks may register or release handlers, including themselves,
//! while being called. A handler released mid-emission is skipped if it has
//! not run yet. Panics are caught per handler and logged.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

type HandlerId = u64;

struct Entry<A: ?Sized> {
    id: HandlerId,
    active: Cell<bool>,
    callback: Box<dyn Fn(&A)>,
}

struct Slots<A: ?Sized> {
    next_id: HandlerId,
    entries: Vec<Rc<Entry<A>>>,
}

/// An ordered list of callbacks taking `&A`.
pub(crate) struct HandlerSet<A: ?Sized> {
    label: &'static str,
    slots: Rc<RefCell<Slots<A>>>,
}

impl<A: ?Sized + 'static> HandlerSet<A> {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            slots: Rc::new(RefCell::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// subscription is released or the set is cleared.
    pub(crate) fn insert(&self, callback: impl Fn(&A) + 'static) -> Subscription {
        let entry = {
            let mut slots = self.slots.borrow_mut();
            let id = slots.next_id;
            slots.next_id += 1;
            let entry = Rc::new(Entry {
                id,
                active: Cell::new(true),
                callback: Box::new(callback),
            });
            slots.entries.push(entry.clone());
            entry
        };

        let id = entry.id;
        let entry: Weak<Entry<A>> = Rc::downgrade(&entry);
        let slots = Rc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(entry) = entry.upgrade() {
                entry.active.set(false);
            }
            if let Some(slots) = slots.upgrade() {
                slots.borrow_mut().entries.retain(|e| e.id != id);
            }
        })
    }

    /// Call every registered handler in registration order. Returns how many
    /// handlers ran to completion.
    pub(crate) fn emit(&self, arg: &A) -> usize {
        self.emit_while(arg, || true)
    }

    /// Like [`emit`](Self::emit), but stops as soon as `keep_going` turns false.
    pub(crate) fn emit_while(&self, arg: &A, mut keep_going: impl FnMut() -> bool) -> usize {
        let snapshot: Vec<Rc<Entry<A>>> = self.slots.borrow().entries.clone();
        let mut completed = 0;

        for entry in snapshot {
            if !keep_going() {
                break;
            }
            if !entry.active.get() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (entry.callback)(arg))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    crate::log_error!(
                        "{} handler #{} panicked: {}",
                        self.label,
                        entry.id,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        completed
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler. Outstanding subscriptions become no-ops.
    pub(crate) fn clear(&self) {
        let drained: Vec<Rc<Entry<A>>> = self.slots.borrow_mut().entries.drain(..).collect();
        for entry in &drained {
            entry.active.set(false);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Capability to stop a registered callback.
///
/// Releasing is idempotent and may happen at any time, including from inside
/// the callback it releases. Dropping a `Subscription` without releasing it
/// leaves the callback registered for the lifetime of its owner.
#[must_use = "call `unsubscribe` to release the handler; dropping keeps it registered"]
pub struct Subscription {
    release: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: RefCell::new(Some(Box::new(release))),
        }
    }

    /// Stop delivery to the handler. Later calls do nothing.
    pub fn unsubscribe(&self) {
        let release = self.release.borrow_mut().take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has been called.
    pub fn is_released(&self) -> bool {
        self.release.borrow().is_none()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("released", &self.is_released())
            .finish()
    }
}
