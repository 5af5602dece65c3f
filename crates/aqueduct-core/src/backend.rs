//! Backend capabilities consumed by the bridge.
//!
//! A backend connection is modelled as three capabilities on one resource:
//!
//! - [`SessionRegistry`]: attach/detach this connection to a session
//! - [`BackendCall`]: synchronous API calls (`endpoint.request`)
//! - [`NotificationSource`]: readiness wait plus a non-blocking drain
//!
//! Implementations may back them with one driver connection or with separate
//! mechanisms; the dispatchers only see these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BackendError;
use crate::ids::{RequestId, SessionId};

/// Arguments of the backend API entry point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// API version, e.g. `"0.3"`.
    pub version: String,
    /// HTTP-style verb (`GET`, `POST`, `PATCH`, `DELETE`, ...).
    pub verb: String,
    /// Resource path, e.g. `/relation/widget/widget`.
    pub uri: String,
    /// Query arguments as a JSON object.
    pub query: Value,
    /// Request body.
    pub data: Value,
    /// Client correlation id.
    pub request_id: RequestId,
}

/// Result of the backend API entry point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Status message.
    pub message: String,
    /// Response body as produced by the backend.
    pub body: String,
    /// Mimetype of `body`.
    pub mimetype: String,
}

impl ApiResponse {
    /// Body as a JSON value: parsed when it is JSON, a string otherwise.
    pub fn data(&self) -> Value {
        parse_or_string(&self.body)
    }
}

/// A notification emitted by the backend for an attached session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Session (channel) the notification was published on.
    pub session_id: SessionId,
    /// Opaque payload.
    pub payload: String,
}

impl Notification {
    /// Create a notification.
    pub fn new(session_id: SessionId, payload: impl Into<String>) -> Self {
        Self {
            session_id,
            payload: payload.into(),
        }
    }

    /// Payload as a JSON value: parsed when it is JSON, a string otherwise.
    pub fn data(&self) -> Value {
        parse_or_string(&self.payload)
    }
}

fn parse_or_string(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

/// Attach/detach a connection's interest in a session. Both operations are
/// idempotent.
#[async_trait]
pub trait SessionRegistry: Send {
    /// Bind this connection to `session_id`'s notifications.
    async fn attach(&mut self, session_id: &SessionId) -> Result<(), BackendError>;
    /// Drop this connection's interest in `session_id`.
    async fn detach(&mut self, session_id: &SessionId) -> Result<(), BackendError>;
}

/// Synchronous API calls proxied through the backend.
#[async_trait]
pub trait BackendCall: Send {
    /// Run the backend API entry point.
    async fn request(&mut self, request: &ApiRequest) -> Result<ApiResponse, BackendError>;
}

/// Source of notifications buffered on a backend connection.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait until at least one notification is buffered.
    ///
    /// Must be cancel-safe: dropping the future loses no notification.
    async fn ready(&mut self) -> Result<(), BackendError>;

    /// Take every notification currently buffered, in arrival order.
    /// Never blocks; returns an empty vector when nothing is buffered.
    fn drain(&mut self) -> Vec<Notification>;
}

/// A backend connection exclusively owned by one client connection.
pub trait Backend: SessionRegistry + BackendCall + NotificationSource {}

impl<T: SessionRegistry + BackendCall + NotificationSource> Backend for T {}

/// Opens backend connections under a resolved role.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced.
    type Conn: Backend + 'static;

    /// Open a new backend connection acting as `role`.
    async fn connect(&self, role: &str) -> Result<Self::Conn, BackendError>;

    /// Short backend name for logging and health output.
    fn backend_name(&self) -> &'static str;
}
