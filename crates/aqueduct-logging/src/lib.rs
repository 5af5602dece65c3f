//! # aqueduct-logging
//!
//! Structured logging with `tracing`.
//!
//! There is no process-wide logging state beyond the subscriber installed at
//! startup. Each websocket connection owns a [`tracing::Span`] created by
//! [`connection_span`]; everything the connection logs is recorded inside it,
//! so concurrent connections never share mutable logging configuration.

#![deny(unsafe_code)]

pub mod test_utils;

use aqueduct_core::ids::ConnectionId;
use serde::{Deserialize, Serialize};
use tracing::Span;

pub use test_utils::{CapturedLogs, capture_logs};

/// Output format for the stderr log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event, with the span list.
    Json,
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level`. Call once at application
/// startup; subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    // try_init is a no-op if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
}

/// Create the span that scopes one websocket connection's logs.
///
/// `session_id` starts empty and is recorded when the connection attaches.
pub fn connection_span(connection_id: &ConnectionId, role: &str) -> Span {
    tracing::info_span!(
        "connection",
        connection_id = %connection_id,
        role = %role,
        session_id = tracing::field::Empty,
    )
}
