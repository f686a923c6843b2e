//! WebSocket connection with state management and auto-reconnect.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use beacon_shared::{Envelope, OutboundMessage};

use super::transport::{Timer, TimerHandle, Transport, TransportConnection};
use crate::config::ConnectionConfig;
use crate::dispatch::MessageDispatcher;
use crate::handlers::{HandlerSet, Subscription};

/// Connection state for a WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    timer: Box<dyn Timer>,
    dispatcher: MessageDispatcher,
    state: Cell<ConnectionState>,
    /// Bumped on every state change; lets an emission notice it was overtaken.
    transitions: Cell<u64>,
    /// Identifies the current socket; events from older sockets are dropped.
    generation: Cell<u64>,
    /// Consecutive reconnect attempts since the last successful open.
    attempts: Cell<u32>,
    destroyed: Cell<bool>,
    connection: RefCell<Option<Box<dyn TransportConnection>>>,
    reconnect_timer: RefCell<Option<TimerHandle>>,
    auth_token: RefCell<Option<String>>,
    status: HandlerSet<ConnectionState>,
}

/// Owner of the single transport connection of a session.
///
/// Cloning yields another handle to the same connection. Transport failures
/// never surface as errors: they show up as a transition to
/// [`ConnectionState::Closed`] followed by the reconnect policy.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Rc<Inner>,
}

impl ConnectionManager {
    /// Create the manager; connects right away when `config.auto_connect` is set.
    pub fn new(
        config: ConnectionConfig,
        transport: impl Transport + 'static,
        timer: impl Timer + 'static,
    ) -> Self {
        let dispatcher = MessageDispatcher::new(config.debug);
        let manager = Self {
            inner: Rc::new(Inner {
                config,
                transport: Box::new(transport),
                timer: Box::new(timer),
                dispatcher,
                state: Cell::new(ConnectionState::Closed),
                transitions: Cell::new(0),
                generation: Cell::new(0),
                attempts: Cell::new(0),
                destroyed: Cell::new(false),
                connection: RefCell::new(None),
                reconnect_timer: RefCell::new(None),
                auth_token: RefCell::new(None),
                status: HandlerSet::new("status"),
            }),
        };

        if manager.inner.config.auto_connect {
            manager.connect();
        }

        manager
    }

    /// Manager using the platform's WebSocket transport and timer.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn native(config: ConnectionConfig) -> Self {
        Self::new(
            config,
            super::transport::TungsteniteTransport,
            super::transport::TokioTimer,
        )
    }

    /// Manager using the platform's WebSocket transport and timer.
    #[cfg(target_arch = "wasm32")]
    pub fn browser(config: ConnectionConfig) -> Self {
        Self::new(
            config,
            super::transport::WebSocketTransport,
            super::transport::BrowserTimer,
        )
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Consecutive failed attempts since the connection was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.get()
    }

    /// Dispatcher fed by this connection's inbound frames.
    pub fn dispatcher(&self) -> MessageDispatcher {
        self.inner.dispatcher.clone()
    }

    /// Observe every state transition. Callbacks run synchronously, in
    /// registration order.
    pub fn on_status_change(&self, callback: impl Fn(ConnectionState) + 'static) -> Subscription {
        self.inner.status.insert(move |state: &ConnectionState| callback(*state))
    }

    /// Start connecting. Does nothing while connecting or open, or once
    /// destroyed.
    pub fn connect(&self) {
        let inner = &self.inner;
        if inner.destroyed.get() {
            crate::trace_debug!(inner.config.debug, "connect() ignored: manager destroyed");
            return;
        }
        if inner.state.get() != ConnectionState::Closed {
            return;
        }

        let pending = inner.reconnect_timer.borrow_mut().take();
        if let Some(pending) = pending {
            pending.cancel();
        }

        let generation = inner.generation.get() + 1;
        inner.generation.set(generation);

        let seq = self.enter(ConnectionState::Connecting);
        if !self.notify(ConnectionState::Connecting, seq) || inner.generation.get() != generation {
            return;
        }

        crate::log_info!("Connecting to {}", inner.config.url);
        let link = TransportLink {
            inner: Rc::downgrade(&self.inner),
            generation,
        };
        match inner.transport.connect(&inner.config.url, link) {
            Ok(connection) => {
                if inner.generation.get() == generation && !inner.destroyed.get() {
                    *inner.connection.borrow_mut() = Some(connection);
                } else {
                    connection.close();
                }
            }
            Err(e) => {
                crate::log_warn!("Connection to {} failed: {}", inner.config.url, e);
                self.handle_closed(generation, Some(e.to_string()));
            }
        }
    }

    /// Hand a message to the transport. Returns `false` when not open or when
    /// the transport refuses the frame; never fails otherwise.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if !self.is_connected() {
            crate::trace_debug!(
                self.inner.config.debug,
                "send '{}' dropped: connection is {}",
                message.kind,
                self.state()
            );
            return false;
        }

        match message.encode() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                crate::log_error!("Failed to encode '{}' message: {}", message.kind, e);
                false
            }
        }
    }

    /// Attach the identity token. Sent right away when open, and first thing
    /// after every later open.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        let token = token.into();
        *self.inner.auth_token.borrow_mut() = Some(token);
        if self.is_connected() {
            self.send_auth();
        }
    }

    /// Forget the identity token. The open connection stays as it is.
    pub fn clear_auth_token(&self) {
        *self.inner.auth_token.borrow_mut() = None;
    }

    pub fn has_auth_token(&self) -> bool {
        self.inner.auth_token.borrow().is_some()
    }

    /// Close for good: stops reconnection, closes the socket and releases
    /// status observers and message handlers. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.replace(true) {
            return;
        }

        let pending = inner.reconnect_timer.borrow_mut().take();
        if let Some(pending) = pending {
            pending.cancel();
        }

        inner.generation.set(inner.generation.get() + 1);
        let connection = inner.connection.borrow_mut().take();

        match inner.state.get() {
            ConnectionState::Open | ConnectionState::Connecting => {
                let seq = self.enter(ConnectionState::Closing);
                self.notify(ConnectionState::Closing, seq);
                if let Some(connection) = connection {
                    connection.close();
                }
                let seq = self.enter(ConnectionState::Closed);
                self.notify(ConnectionState::Closed, seq);
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                if let Some(connection) = connection {
                    connection.close();
                }
            }
        }

        inner.status.clear();
        inner.dispatcher.clear();
        crate::log_info!("Connection to {} destroyed", inner.config.url);
    }

    fn send_frame(&self, frame: String) -> bool {
        let connection = self.inner.connection.borrow();
        let Some(connection) = connection.as_ref() else {
            return false;
        };

        crate::trace_debug!(self.inner.config.debug, "-> {}", frame);
        match connection.send(frame) {
            Ok(()) => true,
            Err(e) => {
                crate::log_warn!("Send to {} failed: {}", self.inner.config.url, e);
                false
            }
        }
    }

    fn send_auth(&self) -> bool {
        let token = self.inner.auth_token.borrow().clone();
        match token {
            Some(token) => self.send(&Envelope::auth(&token)),
            None => false,
        }
    }

    /// Set the state and return its transition number.
    fn enter(&self, next: ConnectionState) -> u64 {
        let inner = &self.inner;
        let previous = inner.state.replace(next);
        let seq = inner.transitions.get() + 1;
        inner.transitions.set(seq);
        crate::trace_debug!(
            inner.config.debug,
            "{}: {} -> {}",
            inner.config.url,
            previous,
            next
        );
        seq
    }

    /// Tell observers about transition `seq`. Stops early and returns false
    /// if an observer caused a newer transition.
    fn notify(&self, state: ConnectionState, seq: u64) -> bool {
        let inner = &self.inner;
        inner
            .status
            .emit_while(&state, || inner.transitions.get() == seq);
        inner.transitions.get() == seq
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.inner.destroyed.get() && self.inner.generation.get() == generation
    }

    fn handle_opened(&self, generation: u64) {
        if !self.is_current(generation) || self.state() != ConnectionState::Connecting {
            return;
        }

        crate::log_info!("WebSocket connected to {}", self.inner.config.url);
        self.inner.attempts.set(0);
        let seq = self.enter(ConnectionState::Open);
        self.send_auth();
        self.notify(ConnectionState::Open, seq);
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        if !self.is_current(generation) || !self.is_connected() {
            return;
        }

        crate::trace_debug!(self.inner.config.debug, "<- {}", text);
        self.inner.dispatcher.dispatch_text(text);
    }

    fn handle_closed(&self, generation: u64, reason: Option<String>) {
        let inner = &self.inner;
        if !self.is_current(generation) || inner.state.get() == ConnectionState::Closed {
            return;
        }

        inner.generation.set(generation + 1);
        let connection = inner.connection.borrow_mut().take();
        drop(connection);

        crate::log_info!(
            "WebSocket to {} closed: {}",
            inner.config.url,
            reason.as_deref().unwrap_or("no reason given")
        );

        let seq = self.enter(ConnectionState::Closed);
        if !self.notify(ConnectionState::Closed, seq) {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let inner = &self.inner;
        if !inner.config.reconnect || inner.destroyed.get() {
            return;
        }

        let attempt = inner.attempts.get();
        if !inner.config.backoff.allows(attempt) {
            crate::log_warn!(
                "Giving up on {} after {} reconnect attempts",
                inner.config.url,
                attempt
            );
            return;
        }

        let delay = inner
            .config
            .backoff
            .jittered_delay(attempt, &mut rand::thread_rng());
        inner.attempts.set(attempt + 1);
        crate::log_info!(
            "Reconnecting to {} in {}ms (attempt {})",
            inner.config.url,
            delay.as_millis(),
            attempt + 1
        );

        let weak = Rc::downgrade(&self.inner);
        let handle = inner.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ConnectionManager { inner }.fire_reconnect();
                }
            }),
        );

        let previous = inner.reconnect_timer.borrow_mut().replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn fire_reconnect(&self) {
        // The task is running, so there is nothing left to cancel.
        let fired = self.inner.reconnect_timer.borrow_mut().take();
        drop(fired);
        self.connect();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url.as_str())
            .field("state", &self.state())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Channel a transport uses to report on one socket.
///
/// Every link is tied to the connection attempt that created it; once the
/// manager moves on (reconnects, destroys, or is dropped) the link's reports
/// are ignored.
#[derive(Clone)]
pub struct TransportLink {
    inner: Weak<Inner>,
    generation: u64,
}

impl TransportLink {
    fn manager(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }

    /// The socket finished its handshake.
    pub fn opened(&self) {
        if let Some(manager) = self.manager() {
            manager.handle_opened(self.generation);
        }
    }

    /// A text frame arrived.
    pub fn frame(&self, text: &str) {
        if let Some(manager) = self.manager() {
            manager.handle_frame(self.generation, text);
        }
    }

    /// The socket failed to open or was closed.
    pub fn closed(&self, reason: Option<String>) {
        if let Some(manager) = self.manager() {
            manager.handle_closed(self.generation, reason);
        }
    }

    /// Whether the manager still listens to this link.
    pub fn is_current(&self) -> bool {
        self.manager()
            .map(|manager| manager.is_current(self.generation))
            .unwrap_or(false)
    }
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::memory::{ManualTimer, MemoryTransport};
    use crate::ws::ReconnectConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("ws://localhost:8080/ws")
            .unwrap()
            .with_backoff(ReconnectConfig {
                jitter: 0.0,
                initial_delay_ms: 100,
                backoff_multiplier: 2.0,
                max_delay_ms: 1000,
                max_attempts: 0,
            })
    }

    fn setup(config: ConnectionConfig) -> (ConnectionManager, MemoryTransport, ManualTimer) {
        let transport = MemoryTransport::new();
        let timer = ManualTimer::new();
        let manager = ConnectionManager::new(config, transport.clone(), timer.clone());
        (manager, transport, timer)
    }

    fn record_states(manager: &ConnectionManager) -> (Rc<RefCell<Vec<ConnectionState>>>, Subscription) {
        let states = Rc::new(RefCell::new(Vec::new()));
        let states_in = states.clone();
        let sub = manager.on_status_change(move |s| states_in.borrow_mut().push(s));
        (states, sub)
    }

    #[test]
    fn auto_connect_opens_on_construction() {
        let (manager, transport, _timer) = setup(config());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(transport.last_url().as_deref(), Some("ws://localhost:8080/ws"));

        transport.open();
        assert!(manager.is_connected());
    }

    #[test]
    fn without_auto_connect_waits_for_connect() {
        let (manager, transport, _timer) = setup(config().with_auto_connect(false));
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(transport.connect_attempts(), 0);

        manager.connect();
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[test]
    fn send_only_succeeds_while_open() {
        let (manager, transport, _timer) = setup(config().with_auto_connect(false));
        let message = Envelope::new("chart.refresh", json!({ "id": 3 }));

        assert!(!manager.send(&message));
        manager.connect();
        assert!(!manager.send(&message));

        transport.open();
        assert!(manager.send(&message));
        assert_eq!(
            transport.take_sent(),
            vec![r#"{"type":"chart.refresh","payload":{"id":3}}"#.to_string()]
        );

        transport.reject_sends(true);
        assert!(!manager.send(&message));
        transport.reject_sends(false);

        transport.drop_connection("server restart");
        assert!(!manager.send(&message));
        manager.destroy();
        assert!(!manager.send(&message));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn observers_see_every_transition() {
        let (manager, transport, timer) = setup(config().with_auto_connect(false));
        let (states, _sub) = record_states(&manager);

        manager.connect();
        transport.open();
        transport.drop_connection("gone");
        timer.fire_next();
        transport.open();
        manager.destroy();

        assert_eq!(
            *states.borrow(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closed,
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Closed,
            ]
        );
    }

    #[test]
    fn observers_are_independent() {
        let (manager, transport, _timer) = setup(config());
        let (first, first_sub) = record_states(&manager);
        let (second, _second_sub) = record_states(&manager);
        let _boom = manager.on_status_change(|_| panic!("observer bug"));

        transport.open();
        first_sub.unsubscribe();
        transport.drop_connection("bye");

        assert_eq!(*first.borrow(), vec![ConnectionState::Open]);
        assert_eq!(
            *second.borrow(),
            vec![ConnectionState::Open, ConnectionState::Closed]
        );
    }

    #[test]
    fn reconnects_with_growing_backoff_and_resets_after_open() {
        let (manager, transport, timer) = setup(config());

        transport.drop_connection("refused");
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(timer.next_delay(), Some(Duration::from_millis(100)));

        timer.fire_next();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        transport.drop_connection("refused");
        assert_eq!(timer.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(manager.reconnect_attempts(), 2);

        timer.fire_next();
        transport.open();
        assert_eq!(manager.reconnect_attempts(), 0);

        transport.drop_connection("idle timeout");
        assert_eq!(timer.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[test]
    fn refused_connect_goes_through_reconnect_policy() {
        let transport = MemoryTransport::new();
        transport.refuse_next_connects(1);
        let timer = ManualTimer::new();
        let manager = ConnectionManager::new(config(), transport.clone(), timer.clone());

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(timer.pending(), 1);

        timer.fire_next();
        transport.open();
        assert!(manager.is_connected());
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut config = config();
        config.backoff.max_attempts = 2;
        let (manager, transport, timer) = setup(config);

        transport.drop_connection("down");
        timer.fire_next();
        transport.drop_connection("down");
        timer.fire_next();
        transport.drop_connection("down");

        assert_eq!(timer.pending(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[test]
    fn no_reconnect_when_disabled() {
        let (manager, transport, timer) = setup(config().with_reconnect(false));
        transport.open();
        transport.drop_connection("bye");

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let (manager, transport, timer) = setup(config());
        let (states, _sub) = record_states(&manager);
        transport.open();

        manager.destroy();
        manager.destroy();

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.is_destroyed());
        assert_eq!(transport.client_closes(), 1);
        assert_eq!(
            *states.borrow(),
            vec![
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Closed
            ]
        );

        manager.connect();
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn destroy_while_waiting_cancels_the_reconnect() {
        let (manager, transport, timer) = setup(config());
        transport.drop_connection("down");
        assert_eq!(timer.pending(), 1);

        manager.destroy();
        assert_eq!(timer.pending(), 0);
        assert!(!timer.fire_next());
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[test]
    fn destroy_from_an_observer_stops_everything() {
        let (manager, transport, timer) = setup(config());
        let handle = manager.clone();
        let _sub = manager.on_status_change(move |state| {
            if state == ConnectionState::Closed {
                handle.destroy();
            }
        });

        transport.open();
        transport.drop_connection("down");

        assert!(manager.is_destroyed());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn late_events_from_an_old_socket_are_ignored() {
        let (manager, transport, _timer) = setup(config());
        let handlers_hit = Rc::new(Cell::new(0));
        let hits = handlers_hit.clone();
        let _sub = manager.dispatcher().on("tick", move |_| {
            hits.set(hits.get() + 1);
            Ok(())
        });

        transport.open();
        manager.destroy();
        transport.open();
        transport.deliver(r#"{"type":"tick"}"#);

        assert_eq!(handlers_hit.get(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[test]
    fn frames_reach_the_dispatcher_in_order() {
        let (manager, transport, _timer) = setup(config());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let _sub = manager.dispatcher().on("tick", move |msg| {
            seen_in.borrow_mut().push(msg.payload.clone());
            Ok(())
        });

        transport.deliver(r#"{"type":"tick","payload":0}"#);
        transport.open();
        for n in 1..=3 {
            transport.deliver(&format!(r#"{{"type":"tick","payload":{}}}"#, n));
        }

        assert_eq!(*seen.borrow(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn auth_token_is_sent_on_open_and_when_set_while_open() {
        let (manager, transport, timer) = setup(config());
        manager.set_auth_token("tok-1");
        assert!(transport.sent().is_empty());

        let sent_at_open = Rc::new(RefCell::new(Vec::new()));
        let probe = transport.clone();
        let sent_in = sent_at_open.clone();
        let _sub = manager.on_status_change(move |state| {
            if state.is_open() {
                *sent_in.borrow_mut() = probe.sent();
            }
        });

        transport.open();
        assert_eq!(
            *sent_at_open.borrow(),
            vec![r#"{"type":"auth","payload":{"token":"tok-1"}}"#.to_string()]
        );
        transport.take_sent();

        manager.set_auth_token("tok-2");
        assert_eq!(transport.take_sent_envelopes(), vec![Envelope::auth("tok-2")]);
        assert!(manager.is_connected());
        assert_eq!(transport.connect_attempts(), 1);

        transport.drop_connection("rotate");
        timer.fire_next();
        transport.open();
        assert_eq!(transport.take_sent_envelopes(), vec![Envelope::auth("tok-2")]);

        manager.clear_auth_token();
        transport.drop_connection("rotate");
        timer.fire_next();
        transport.open();
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn debug_tracing_does_not_change_behavior() {
        let (quiet, quiet_transport, _t1) = setup(config());
        let (loud, loud_transport, _t2) = setup(config().with_debug(true));

        for (manager, transport) in [(&quiet, &quiet_transport), (&loud, &loud_transport)] {
            assert!(!manager.send(&Envelope::new("x", json!(null))));
            transport.open();
            assert!(manager.send(&Envelope::new("x", json!(null))));
            transport.deliver("garbage");
        }

        assert_eq!(quiet_transport.sent(), loud_transport.sent());
        assert_eq!(quiet.state(), loud.state());
    }
}
