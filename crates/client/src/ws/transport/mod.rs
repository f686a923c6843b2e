//! The I/O boundary of a connection.
//!
//! A [`Transport`] opens sockets and reports what happens to them through a
//! [`TransportLink`]; a [`Timer`] runs the reconnect backoff. Both are
//! injected into the [`ConnectionManager`](super::ConnectionManager), which
//! conditionally gets the platform-specific implementation by default.

use std::time::Duration;

use url::Url;

use crate::error::TransportError;

pub use super::connection::TransportLink;

/// Opens connections.
///
/// Implementations must not call into the `link` synchronously from
/// [`connect`](Transport::connect); every event is reported later, from the
/// event loop.
pub trait Transport {
    fn connect(
        &self,
        url: &Url,
        link: TransportLink,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// One live (or opening) socket.
pub trait TransportConnection {
    /// Queue a text frame. Must not block and must not call back into the
    /// link.
    fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Close the socket. Events reported afterwards are ignored by the manager.
    fn close(&self);
}

/// Runs a task once after a delay.
///
/// `schedule` must not run the task synchronously.
pub trait Timer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle;
}

/// Cancels a scheduled task. Dropping the handle leaves the task scheduled.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce()>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(self) {
        (self.cancel)();
    }
}

pub mod memory;

// Include platform-specific implementation
#[cfg(target_arch = "wasm32")]
mod transport_wasm;
#[cfg(target_arch = "wasm32")]
pub use transport_wasm::{BrowserTimer, WebSocketTransport};

#[cfg(not(target_arch = "wasm32"))]
mod transport_native;
#[cfg(not(target_arch = "wasm32"))]
pub use transport_native::{TokioTimer, TungsteniteTransport};
