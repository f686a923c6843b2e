//! Beacon CLI - headless realtime client
//!
//! Connects to the server named by `BEACON_WS_URL`, joins the channels of the
//! identity given through the environment, and logs status changes and
//! notifications until Ctrl-C.

use anyhow::Context;
use beacon_client::{ConnectionConfig, Identity, RealtimeSession};
use beacon_shared::TYPE_NOTIFICATION;

const ENV_USER_ID: &str = "BEACON_USER_ID";
const ENV_ROLE: &str = "BEACON_ROLE";
const ENV_ORG: &str = "BEACON_ORG";
const ENV_TOKEN: &str = "BEACON_TOKEN";

fn main() -> anyhow::Result<()> {
    beacon_client::logging::init_tracing("beacon=info,beacon_client=info");

    let config = ConnectionConfig::from_env().context("invalid connection configuration")?;
    let identity = identity_from_lookup(|key| std::env::var(key).ok());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, run(config, identity))
}

async fn run(config: ConnectionConfig, identity: Option<Identity>) -> anyhow::Result<()> {
    tracing::info!("Starting beacon client for {}", config.url);
    let session = RealtimeSession::native(config);

    let _status = session.on_status_change(|state| {
        tracing::info!("Connection {}", state);
    });

    let _unread = session.notification_store().on_change(|items| {
        let unread = items.iter().filter(|n| !n.read).count();
        tracing::info!("{} notifications, {} unread", items.len(), unread);
    });

    let _other = session.dispatcher().on_any(|message| {
        if message.kind != TYPE_NOTIFICATION {
            tracing::debug!(
                "Received '{}' on {}: {}",
                message.kind,
                message
                    .channel
                    .as_ref()
                    .map(|c| c.as_str())
                    .unwrap_or("-"),
                message.payload
            );
        }
        Ok(())
    });

    match identity {
        Some(identity) => {
            tracing::info!("Identified as user {}", identity.user_id);
            session.set_identity(Some(identity));
        }
        None => tracing::warn!("{} not set, running without identity", ENV_USER_ID),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    session.destroy();
    Ok(())
}

/// Identity described by the `BEACON_*` variables, if a user id is set.
fn identity_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Identity> {
    let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let mut identity = Identity::new(value(ENV_USER_ID)?);
    if let Some(role) = value(ENV_ROLE) {
        identity = identity.with_role(role);
    }
    if let Some(org) = value(ENV_ORG) {
        identity = identity.with_organization(org);
    }
    if let Some(token) = value(ENV_TOKEN) {
        identity = identity.with_token(token);
    }
    Some(identity)
}
