//! Desired channel set, kept in sync with the server across reconnects.
//!
//! The registry only remembers what the session wants. A fresh connection
//! knows nothing of earlier subscriptions, so every transition into `Open`
//! replays the whole set; while open, changes go out immediately.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use beacon_shared::{Channel, Envelope};

use crate::handlers::Subscription;
use crate::identity::{channels_for_identity, Identity};
use crate::ws::{ConnectionManager, ConnectionState};

#[derive(Default)]
struct Desired {
    /// Channels asked for explicitly.
    manual: BTreeSet<Channel>,
    /// Channels derived from the current identity.
    derived: BTreeSet<Channel>,
    /// Derived channels the user unsubscribed from. They stay out until the
    /// identity stops implying them.
    dismissed: BTreeSet<Channel>,
}

impl Desired {
    fn all(&self) -> BTreeSet<Channel> {
        self.manual
            .iter()
            .chain(self.derived.difference(&self.dismissed))
            .cloned()
            .collect()
    }

    fn contains(&self, channel: &Channel) -> bool {
        self.manual.contains(channel)
            || (self.derived.contains(channel) && !self.dismissed.contains(channel))
    }
}

struct RegistryInner {
    connection: ConnectionManager,
    desired: RefCell<Desired>,
    /// Whether the desired set has been replayed on the current open
    /// connection. Until then changes wait for the replay.
    synced: Cell<bool>,
    status: RefCell<Option<Subscription>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(status) = self.status.get_mut().take() {
            status.unsubscribe();
        }
    }
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Rc<RegistryInner>,
}

impl ChannelRegistry {
    /// Attach a registry to `connection`. Subscriptions made before the
    /// connection opens are queued until it does.
    pub fn new(connection: &ConnectionManager) -> Self {
        let inner = Rc::new(RegistryInner {
            connection: connection.clone(),
            desired: RefCell::new(Desired::default()),
            synced: Cell::new(false),
            status: RefCell::new(None),
        });

        let weak: Weak<RegistryInner> = Rc::downgrade(&inner);
        let status = connection.on_status_change(move |state| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if state == ConnectionState::Open {
                ChannelRegistry { inner }.resubscribe_all();
            } else {
                inner.synced.set(false);
            }
        });
        *inner.status.borrow_mut() = Some(status);

        let registry = Self { inner };
        if connection.is_connected() {
            registry.resubscribe_all();
        }
        registry
    }

    /// Add `channel` to the desired set. Idempotent.
    pub fn subscribe(&self, channel: impl Into<Channel>) {
        let channel = channel.into();
        self.update(|desired| {
            desired.dismissed.remove(&channel);
            desired.manual.insert(channel);
        });
    }

    /// Remove `channel` from the desired set, whether it was asked for
    /// explicitly or came from the identity. Idempotent.
    pub fn unsubscribe(&self, channel: impl Into<Channel>) {
        let channel = channel.into();
        self.update(|desired| {
            desired.manual.remove(&channel);
            if desired.derived.contains(&channel) {
                desired.dismissed.insert(channel);
            }
        });
    }

    /// Replace the identity-derived channels with those of `identity`.
    ///
    /// Only the difference to the previous identity's channels is applied:
    /// channels subscribed explicitly are left alone, and a derived channel
    /// the user unsubscribed from only comes back if the new identity adds it
    /// afresh.
    pub fn apply_identity(&self, identity: Option<&Identity>) {
        let channels = channels_for_identity(identity);
        if self.inner.desired.borrow().derived == channels {
            return;
        }
        self.update(|desired| {
            desired.dismissed.retain(|c| channels.contains(c));
            desired.derived = channels;
        });
    }

    /// The desired channel set.
    pub fn channels(&self) -> BTreeSet<Channel> {
        self.inner.desired.borrow().all()
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.inner.desired.borrow().contains(channel)
    }

    /// Send a subscribe frame for every desired channel.
    fn resubscribe_all(&self) {
        self.inner.synced.set(true);
        let channels = self.channels();
        let connection = &self.inner.connection;
        crate::trace_debug!(
            connection.config().debug,
            "Re-applying {} channel subscriptions",
            channels.len()
        );
        for channel in &channels {
            connection.send(&Envelope::subscribe(channel));
        }
    }

    /// Mutate the desired set and, once the open connection has been synced,
    /// tell the server about the difference.
    fn update(&self, mutate: impl FnOnce(&mut Desired)) {
        let (removed, added) = {
            let mut desired = self.inner.desired.borrow_mut();
            let before = desired.all();
            mutate(&mut desired);
            let after = desired.all();
            let removed: Vec<Channel> = before.difference(&after).cloned().collect();
            let added: Vec<Channel> = after.difference(&before).cloned().collect();
            (removed, added)
        };

        let connection = &self.inner.connection;
        if !connection.is_connected() || !self.inner.synced.get() {
            return;
        }
        for channel in &removed {
            connection.send(&Envelope::unsubscribe(channel));
        }
        for channel in &added {
            connection.send(&Envelope::subscribe(channel));
        }
    }
}
