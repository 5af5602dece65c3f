//! Error types shared across the bridge.

use crate::protocol::LogLevel;

/// Errors raised by a backend connection.
///
/// Classifies conditions as advisory (reported to the client, connection
/// continues) or fatal (the connection loop exits).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A statement-level condition raised by the backend (warning, permission
    /// denied, failed stored procedure). The connection itself is healthy.
    #[error("backend {level}: {message}")]
    Advisory {
        /// Severity reported to the client.
        level: LogLevel,
        /// Primary message text.
        message: String,
    },
    /// The backend connection failed or was terminated by the server.
    #[error("backend connection lost: {0}")]
    ConnectionLost(String),
    /// The backend connection was closed.
    #[error("backend connection closed")]
    Closed,
}

impl BackendError {
    /// Build a warning-level advisory condition.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Advisory {
            level: LogLevel::Warn,
            message: message.into(),
        }
    }

    /// Whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Closed)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Advisory { .. } => "advisory",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Closed => "closed",
        }
    }
}

/// Reasons a client frame could not be turned into a command.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The object has no string `method` field.
    #[error("missing \"method\" discriminator")]
    MissingMethod,
    /// The method is known but its fields are wrong.
    #[error("invalid {method} command: {reason}")]
    InvalidFields {
        /// Method name from the frame.
        method: String,
        /// What was wrong.
        reason: String,
    },
}
