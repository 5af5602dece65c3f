//! Server configuration.

use std::time::Duration;

use aqueduct_settings::Settings;

use crate::websocket::heartbeat::HeartbeatConfig;

/// Runtime configuration for the bridge server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Path of the websocket endpoint.
    pub ws_path: String,
    /// Accepted `Origin` values; empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Maximum concurrent websocket connections.
    pub max_connections: usize,
    /// Max inbound websocket message size in bytes.
    pub max_message_size: usize,
    /// Backend role for requests without an authenticated role.
    pub anonymous_role: String,
    /// Keepalive timing.
    pub heartbeat: HeartbeatConfig,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            ws_path: settings.server.ws_path.clone(),
            allowed_origins: settings.server.allowed_origins.clone(),
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            anonymous_role: settings.database.anonymous_role.clone(),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(settings.bridge.heartbeat_interval_secs),
                timeout: Duration::from_secs(settings.bridge.heartbeat_timeout_secs),
            },
        }
    }

    /// Whether a handshake with this `Origin` header may proceed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|a| a == o))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/_socket".into(),
            allowed_origins: Vec::new(),
            max_connections: 1_000,
            max_message_size: 1024 * 1024,
            anonymous_role: "anonymous".into(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}
