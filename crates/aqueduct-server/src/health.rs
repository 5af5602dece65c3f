//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Backend in use (`"postgres"` or `"memory"`).
    pub backend: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current websocket connection count.
    pub connections: usize,
    /// Distinct sessions attached across all connections.
    pub attached_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    backend: &str,
    connections: usize,
    attached_sessions: usize,
    shutting_down: bool,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        backend: backend.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        attached_sessions,
    }
}
