//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Rejected handshakes total (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTED_TOTAL: &str = "ws_handshake_rejected_total";
/// Backend connect failures total (counter).
pub const BACKEND_CONNECT_FAILURES_TOTAL: &str = "backend_connect_failures_total";
/// Commands dispatched total (counter, labels: method).
pub const COMMANDS_TOTAL: &str = "bridge_commands_total";
/// Inbound frames that could not be decoded (counter).
pub const MALFORMED_FRAMES_TOTAL: &str = "bridge_malformed_frames_total";
/// Inbound frames with an unknown method (counter).
pub const UNRECOGNIZED_FRAMES_TOTAL: &str = "bridge_unrecognized_frames_total";
/// Notifications sent as `event` frames (counter).
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "bridge_notifications_delivered_total";
/// Notifications dropped for a session the connection is not attached to (counter).
pub const NOTIFICATIONS_SUPPRESSED_TOTAL: &str = "bridge_notifications_suppressed_total";
/// Advisory backend conditions reported as `log` frames (counter, labels: method).
pub const BACKEND_ADVISORIES_TOTAL: &str = "bridge_backend_advisories_total";
