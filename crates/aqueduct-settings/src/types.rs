//! Settings types with compiled defaults.
//!
//! Every struct uses `#[serde(default)]` so a settings file only has to name
//! the values it changes.

use aqueduct_logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Placeholder written in place of secrets by [`Settings::redacted`].
pub const REDACTED: &str = "********";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// HTTP/websocket listener.
    pub server: ServerSettings,
    /// Backend database connection.
    pub database: DatabaseSettings,
    /// Per-connection bridge behaviour.
    pub bridge: BridgeSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must start with '/': {}",
                self.server.ws_path
            )));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be at least 1".into(),
            ));
        }
        if self.bridge.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "bridge.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if self.bridge.heartbeat_timeout_secs < self.bridge.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "bridge.heartbeatTimeoutSecs ({}) is shorter than the interval ({})",
                self.bridge.heartbeat_timeout_secs, self.bridge.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    /// Copy with secrets replaced by [`REDACTED`], for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.database.password.is_some() {
            copy.database.password = Some(REDACTED.to_owned());
        }
        copy
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Path of the websocket endpoint.
    pub ws_path: String,
    /// Accepted `Origin` header values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Maximum number of concurrent websocket connections.
    pub max_connections: usize,
    /// Maximum inbound websocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_path: "/_socket".to_string(),
            allowed_origins: Vec::new(),
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Backend database connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database name.
    pub name: String,
    /// Login user. Each connection then switches to its resolved role.
    pub user: String,
    /// Login password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Role used when the request carries no authenticated role.
    pub anonymous_role: String,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "aquameta".to_string(),
            user: "postgres".to_string(),
            password: None,
            anonymous_role: "anonymous".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// Per-connection bridge settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Keepalive tick interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without any client frame.
    pub heartbeat_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
