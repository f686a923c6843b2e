//! Client error types.
//!
//! None of these reach callers of `send`/`subscribe`/`destroy`: transport
//! failures become state transitions and frame errors are logged. Only
//! configuration returns them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no server URL configured (set {0})")]
    MissingUrl(&'static str),
    #[error("invalid server URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme '{0}' (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection is closed")]
    Closed,
}
