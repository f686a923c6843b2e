//! WebSocket connection layer.
//!
//! This module provides:
//! - Connection state machine with auto-reconnect and jittered backoff
//! - Pluggable transports (tungstenite, browser `WebSocket`, in-memory)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ConnectionManager                   │
//! │     (state, reconnect timer, auth token, sends)     │
//! └─────────────────────────────────────────────────────┘
//!          │ connect/send           ▲ TransportLink
//!          ▼                        │ opened/frame/closed
//!   ┌──────────────────────────────────────────────┐
//!   │ Transport (TungsteniteTransport |            │
//!   │   WebSocketTransport | MemoryTransport)      │
//!   └──────────────────────────────────────────────┘
//!                         │ text frames
//!                         ▼
//!              ┌─────────────────────┐
//!              │  MessageDispatcher  │
//!              └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = ConnectionConfig::new("https://example.com")?;
//! let manager = ConnectionManager::native(config);
//! let _status = manager.on_status_change(|state| println!("{state}"));
//! let _kpis = manager.dispatcher().on("kpi", |msg| {
//!     println!("{}", msg.payload);
//!     Ok(())
//! });
//! ```

mod backoff;
mod connection;
pub mod transport;

pub use backoff::ReconnectConfig;
pub use connection::{ConnectionManager, ConnectionState, TransportLink};
pub use transport::memory::{ManualTimer, MemoryTransport};
pub use transport::{Timer, TimerHandle, Transport, TransportConnection};

#[cfg(not(target_arch = "wasm32"))]
pub use transport::{TokioTimer, TungsteniteTransport};

#[cfg(target_arch = "wasm32")]
pub use transport::{BrowserTimer, WebSocketTransport};
