//! Connection configuration, built in code or from environment variables.

use beacon_shared::DEFAULT_WS_PATH;
use url::Url;

use crate::error::ConfigError;
use crate::ws::ReconnectConfig;

pub const ENV_URL: &str = "BEACON_WS_URL";
pub const ENV_RECONNECT: &str = "BEACON_RECONNECT";
pub const ENV_AUTO_CONNECT: &str = "BEACON_AUTO_CONNECT";
pub const ENV_DEBUG: &str = "BEACON_DEBUG";
pub const ENV_BACKOFF_INITIAL_MS: &str = "BEACON_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "BEACON_BACKOFF_MAX_MS";
pub const ENV_BACKOFF_MAX_ATTEMPTS: &str = "BEACON_BACKOFF_MAX_ATTEMPTS";

/// Options for one [`ConnectionManager`](crate::ws::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, always `ws://` or `wss://`.
    pub url: Url,
    /// Re-enter `Connecting` after the connection drops.
    pub reconnect: bool,
    /// Start connecting as soon as the manager is built.
    pub auto_connect: bool,
    /// Trace every transition and frame.
    pub debug: bool,
    pub backoff: ReconnectConfig,
}

impl ConnectionConfig {
    /// Build a config with defaults for everything but the URL.
    ///
    /// `http(s)` URLs are mapped to `ws(s)`, and a bare host gets the
    /// default `/ws` path.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            url: normalize_ws_url(url)?,
            reconnect: true,
            auto_connect: true,
            debug: false,
            backoff: ReconnectConfig::default(),
        })
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_backoff(mut self, backoff: ReconnectConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BEACON_WS_URL`: server URL (required)
    /// - `BEACON_RECONNECT`: "true" | "false" (default: "true")
    /// - `BEACON_AUTO_CONNECT`: "true" | "false" (default: "true")
    /// - `BEACON_DEBUG`: "true" | "false" (default: "false")
    /// - `BEACON_BACKOFF_INITIAL_MS`: first reconnect delay (default: 1000)
    /// - `BEACON_BACKOFF_MAX_MS`: reconnect delay ceiling (default: 30000)
    /// - `BEACON_BACKOFF_MAX_ATTEMPTS`: 0 for unlimited (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup(ENV_URL)
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUrl(ENV_URL))?;
        let mut config = Self::new(&url)?;

        if let Some(value) = lookup(ENV_RECONNECT) {
            config.reconnect = parse_bool(ENV_RECONNECT, &value)?;
        }
        if let Some(value) = lookup(ENV_AUTO_CONNECT) {
            config.auto_connect = parse_bool(ENV_AUTO_CONNECT, &value)?;
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            config.debug = parse_bool(ENV_DEBUG, &value)?;
        }
        if let Some(value) = lookup(ENV_BACKOFF_INITIAL_MS) {
            config.backoff.initial_delay_ms = parse_u32(ENV_BACKOFF_INITIAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_BACKOFF_MAX_MS) {
            config.backoff.max_delay_ms = parse_u32(ENV_BACKOFF_MAX_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_BACKOFF_MAX_ATTEMPTS) {
            config.backoff.max_attempts = parse_u32(ENV_BACKOFF_MAX_ATTEMPTS, &value)?;
        }

        Ok(config)
    }
}

/// Turn a user-supplied server address into a WebSocket endpoint URL.
pub fn normalize_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::MissingUrl(ENV_URL));
    }

    let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_WS_PATH);
    }

    Ok(url)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
