//! Session identity and the channels it implies.

use std::collections::BTreeSet;

use beacon_shared::Channel;
use serde::{Deserialize, Serialize};

/// Who the session belongs to, as supplied by the identity subsystem.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Option<String>,
    pub organization_type: Option<String>,
    /// Opaque token forwarded to the server in the auth frame.
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_organization(mut self, organization_type: impl Into<String>) -> Self {
        self.organization_type = Some(organization_type.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Channels a session with `identity` listens on: `general`, the user's own
/// channel, and its role and organization channels when known. No identity
/// means no channels.
pub fn channels_for_identity(identity: Option<&Identity>) -> BTreeSet<Channel> {
    let mut channels = BTreeSet::new();
    let Some(identity) = identity else {
        return channels;
    };

    channels.insert(Channel::general());

    let user_id = identity.user_id.trim();
    if !user_id.is_empty() {
        channels.insert(Channel::user(user_id));
    }
    if let Some(role) = non_empty(identity.role.as_deref()) {
        channels.insert(Channel::role(role));
    }
    if let Some(org) = non_empty(identity.organization_type.as_deref()) {
        channels.insert(Channel::org(org));
    }

    channels
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
