//! The realtime session: one connection, its channel registry and the
//! notification store, bound to one identity.

use std::cell::RefCell;
use std::collections::BTreeSet;

use beacon_shared::{Channel, Envelope, InboundMessage, Notification};
use serde_json::Value;

use crate::alerts::AlertSink;
use crate::config::ConnectionConfig;
use crate::dispatch::MessageDispatcher;
use crate::handlers::Subscription;
use crate::identity::Identity;
use crate::registry::ChannelRegistry;
use crate::stores::NotificationAggregator;
use crate::ws::{ConnectionManager, ConnectionState, Timer, Transport};

/// Application entry point to realtime features.
///
/// Dropping the session destroys the connection.
pub struct RealtimeSession {
    connection: ConnectionManager,
    registry: ChannelRegistry,
    notifications: NotificationAggregator,
    identity: RefCell<Option<Identity>>,
}

impl RealtimeSession {
    pub fn new(
        config: ConnectionConfig,
        transport: impl Transport + 'static,
        timer: impl Timer + 'static,
        alerts: impl AlertSink + 'static,
    ) -> Self {
        let connection = ConnectionManager::new(config, transport, timer);
        let registry = ChannelRegistry::new(&connection);
        let notifications = NotificationAggregator::new(&connection.dispatcher(), alerts);

        Self {
            connection,
            registry,
            notifications,
            identity: RefCell::new(None),
        }
    }

    /// Session over tokio-tungstenite that logs alerts. Must run inside a
    /// `tokio::task::LocalSet`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn native(config: ConnectionConfig) -> Self {
        Self::new(
            config,
            crate::ws::TungsteniteTransport,
            crate::ws::TokioTimer,
            crate::alerts::LogAlerts,
        )
    }

    /// Session over the browser's `WebSocket` that logs alerts.
    #[cfg(target_arch = "wasm32")]
    pub fn browser(config: ConnectionConfig) -> Self {
        Self::new(
            config,
            crate::ws::WebSocketTransport,
            crate::ws::BrowserTimer,
            crate::alerts::LogAlerts,
        )
    }

    /// Switch to `identity`, or to nobody. Updates the auth token and moves
    /// the identity channels over to the new ones.
    pub fn set_identity(&self, identity: Option<Identity>) {
        match identity.as_ref().and_then(|i| i.token.clone()) {
            Some(token) => self.connection.set_auth_token(token),
            None => self.connection.clear_auth_token(),
        }
        self.registry.apply_identity(identity.as_ref());
        *self.identity.borrow_mut() = identity;
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Send a message of type `kind`. Returns false unless the connection is
    /// open and the transport took the frame.
    pub fn send(&self, kind: &str, payload: Value, channel: Option<Channel>) -> bool {
        let mut message = Envelope::new(kind, payload);
        message.channel = channel;
        self.connection.send(&message)
    }

    pub fn subscribe(&self, channel: impl Into<Channel>) {
        self.registry.subscribe(channel);
    }

    pub fn unsubscribe(&self, channel: impl Into<Channel>) {
        self.registry.unsubscribe(channel);
    }

    pub fn channels(&self) -> BTreeSet<Channel> {
        self.registry.channels()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn on_status_change(&self, callback: impl Fn(ConnectionState) + 'static) -> Subscription {
        self.connection.on_status_change(callback)
    }

    /// Handle inbound messages of type `kind`.
    pub fn on(
        &self,
        kind: &str,
        handler: impl Fn(&InboundMessage) -> anyhow::Result<()> + 'static,
    ) -> Subscription {
        self.connection.dispatcher().on(kind, handler)
    }

    /// Snapshot of received notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.notifications()
    }

    pub fn notification_store(&self) -> &NotificationAggregator {
        &self.notifications
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn dispatcher(&self) -> MessageDispatcher {
        self.connection.dispatcher()
    }

    /// Close the connection for good and release every handler.
    pub fn destroy(&self) {
        self.connection.destroy();
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
