//! Beacon Client - realtime transport and notifications
//!
//! This crate keeps one WebSocket connection per session alive, fans inbound
//! messages out to typed handlers, maintains channel subscriptions across
//! reconnects, and aggregates server-pushed notifications. It runs on native
//! targets (tokio + tungstenite) and in the browser (wasm32).

pub mod logging;

pub mod alerts;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod registry;
pub mod session;
pub mod stores;
pub mod ws;

pub use alerts::{Alert, AlertSink, LogAlerts};
pub use config::ConnectionConfig;
pub use dispatch::MessageDispatcher;
pub use error::{ConfigError, TransportError};
pub use handlers::Subscription;
pub use identity::{channels_for_identity, Identity};
pub use registry::ChannelRegistry;
pub use session::RealtimeSession;
pub use stores::NotificationAggregator;
pub use ws::{ConnectionManager, ConnectionState, ReconnectConfig};

pub use beacon_shared as shared;
