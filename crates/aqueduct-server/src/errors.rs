//! Server and per-connection error types.

use aqueduct_core::errors::BackendError;

/// Errors starting or running the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Could not bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// I/O failure on the bound listener.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// A failure reading from or writing to the client socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("socket error: {0}")]
pub struct SocketError(pub String);

/// Conditions that end a connection's loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Client socket failure.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// Fatal backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// A dispatcher panicked.
    #[error("connection task panicked: {0}")]
    Panicked(String),
}

impl ConnectionError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Backend(e) => e.error_kind(),
            Self::Panicked(_) => "panic",
        }
    }
}
