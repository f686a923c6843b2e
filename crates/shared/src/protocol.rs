//! Frame envelope, channel names and control frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ProtocolError;

/// Message type of a channel subscribe control frame.
pub const TYPE_SUBSCRIBE: &str = "subscribe";
/// Message type of a channel unsubscribe control frame.
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";
/// Message type of the identity frame sent after the connection opens.
pub const TYPE_AUTH: &str = "auth";
/// Message type of server-pushed notifications.
pub const TYPE_NOTIFICATION: &str = "notification";

/// Default path of the WebSocket upgrade endpoint.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// A logical topic scoping which events a client receives.
///
/// Channels are opaque strings; the constructors below produce the
/// identity-derived names the server understands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The broadcast channel every session joins.
    pub fn general() -> Self {
        Self::new("general")
    }

    pub fn user(user_id: &str) -> Self {
        Self(format!("user:{}", user_id))
    }

    pub fn role(role: &str) -> Self {
        Self(format!("role:{}", role))
    }

    pub fn org(organization_type: &str) -> Self {
        Self(format!("org:{}", organization_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One discrete frame exchanged over the connection.
///
/// The same envelope carries control frames and application messages in both
/// directions: `{"type": ..., "payload": ..., "channel"?: ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

/// A frame received from the server.
pub type InboundMessage = Envelope;
/// A frame queued for the server.
pub type OutboundMessage = Envelope;

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            channel: None,
        }
    }

    /// Scope this message to a channel.
    pub fn on_channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn subscribe(channel: &Channel) -> Self {
        Self::new(TYPE_SUBSCRIBE, json!({ "channel": channel }))
    }

    pub fn unsubscribe(channel: &Channel) -> Self {
        Self::new(TYPE_UNSUBSCRIBE, json!({ "channel": channel }))
    }

    pub fn auth(token: &str) -> Self {
        Self::new(TYPE_AUTH, json!({ "token": token }))
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        if envelope.kind.trim().is_empty() {
            return Err(ProtocolError::MissingType);
        }
        Ok(envelope)
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Channel named by a subscribe/unsubscribe control frame.
    pub fn control_channel(&self) -> Option<Channel> {
        if self.kind != TYPE_SUBSCRIBE && self.kind != TYPE_UNSUBSCRIBE {
            return None;
        }
        self.payload
            .get("channel")
            .and_then(Value::as_str)
            .map(Channel::from)
    }
}
