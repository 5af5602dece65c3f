//! Wire protocol: JSON frames exchanged over the upgraded socket.
//!
//! Inbound frames are decoded once, at the boundary, into the closed
//! [`Command`] enum. Anything that is not a well-formed command becomes an
//! explicit [`Decoded::Unrecognized`] or [`Decoded::Malformed`] value rather
//! than a lookup failure deeper in the dispatcher.
//!
//! Outbound frames are [`Frame`] values tagged by `method`:
//!
//! ```text
//! {"method":"response","request_id":"r1","data":{...}}
//! {"method":"event","data":{...}}
//! {"method":"log","level":"warn","message":"..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::ApiRequest;
use crate::errors::DecodeError;
use crate::ids::{RequestId, SessionId};

/// API version used when a `request` command does not name one.
pub const DEFAULT_API_VERSION: &str = "0.3";

/// Severity carried by `log` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Detailed entry/exit points.
    Trace,
    /// Intermediate values, decisions.
    Debug,
    /// Outcomes, summaries.
    Info,
    /// Non-fatal issues.
    Warn,
    /// Errors.
    Error,
}

impl LogLevel {
    /// Convert from a string (case-insensitive). Understands PostgreSQL
    /// severity names (`NOTICE`, `WARNING`, `FATAL`, ...).
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "fatal" | "panic" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A decoded client command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Application-level keepalive. Never answered.
    Ping,
    /// Bind this connection to a session's notifications.
    Attach {
        /// Session to attach; `None` makes the command a no-op.
        session_id: Option<SessionId>,
        /// Optional correlation id echoed in the acknowledgement.
        request_id: Option<RequestId>,
    },
    /// Drop this connection's interest in a session.
    Detach {
        /// Session to detach; `None` makes the command a no-op.
        session_id: Option<SessionId>,
        /// Optional correlation id echoed in the acknowledgement.
        request_id: Option<RequestId>,
    },
    /// A synchronous API call proxied over the socket.
    Request(ApiRequest),
}

impl Command {
    /// Wire name of the command.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Attach { .. } => "attach",
            Self::Detach { .. } => "detach",
            Self::Request(_) => "request",
        }
    }
}

/// Outcome of decoding one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    /// Nothing to decode this wake.
    Empty,
    /// A well-formed command.
    Command(Command),
    /// Well-formed JSON naming a method this bridge does not handle.
    Unrecognized {
        /// The unknown method name.
        method: String,
    },
    /// The frame could not be decoded.
    Malformed(DecodeError),
}

/// Decode a raw text frame into a [`Command`].
pub fn decode(raw: &str) -> Decoded {
    if raw.trim().is_empty() {
        return Decoded::Empty;
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Decoded::Malformed(DecodeError::Json(e)),
    };
    let Value::Object(obj) = value else {
        return Decoded::Malformed(DecodeError::NotAnObject);
    };
    let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_owned) else {
        return Decoded::Malformed(DecodeError::MissingMethod);
    };

    let command = match method.as_str() {
        "ping" => Ok(Command::Ping),
        "attach" => session_fields(&obj).map(|(session_id, request_id)| Command::Attach {
            session_id,
            request_id,
        }),
        "detach" => session_fields(&obj).map(|(session_id, request_id)| Command::Detach {
            session_id,
            request_id,
        }),
        "request" => request_fields(obj).map(Command::Request),
        _ => return Decoded::Unrecognized { method },
    };

    match command {
        Ok(cmd) => Decoded::Command(cmd),
        Err(reason) => Decoded::Malformed(DecodeError::InvalidFields { method, reason }),
    }
}

fn session_fields(
    obj: &Map<String, Value>,
) -> Result<(Option<SessionId>, Option<RequestId>), String> {
    let session_id = match obj.get("session_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() || s == "null" => None,
        Some(Value::String(s)) => Some(SessionId::from_raw(s.as_str())),
        Some(Value::Number(n)) => Some(SessionId::from_raw(n.to_string())),
        Some(other) => return Err(format!("session_id must be a string, got {other}")),
    };
    Ok((session_id, optional_request_id(obj)?))
}

fn optional_request_id(obj: &Map<String, Value>) -> Result<Option<RequestId>, String> {
    match obj.get("request_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::from_raw(s.as_str()))),
        Some(Value::Number(n)) => Ok(Some(RequestId::from_raw(n.to_string()))),
        Some(other) => Err(format!("request_id must be a string, got {other}")),
    }
}

#[derive(Deserialize)]
struct WireRequest {
    #[serde(default)]
    version: Option<String>,
    verb: String,
    uri: String,
    #[serde(default)]
    query: Value,
    #[serde(default)]
    data: Value,
}

fn request_fields(obj: Map<String, Value>) -> Result<ApiRequest, String> {
    let request_id = optional_request_id(&obj)?.ok_or_else(|| "missing field `request_id`".to_string())?;
    let wire: WireRequest = serde_json::from_value(Value::Object(obj)).map_err(|e| e.to_string())?;

    // Older clients send the query as a JSON-encoded string.
    let query = match wire.query {
        Value::Null => Value::Object(Map::new()),
        Value::String(s) if s.trim().is_empty() => Value::Object(Map::new()),
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .map_err(|e| format!("query is not valid JSON: {e}"))?,
        other => other,
    };
    if !query.is_object() {
        return Err("query must be a JSON object".into());
    }

    Ok(ApiRequest {
        version: wire.version.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        verb: wire.verb,
        uri: wire.uri,
        query,
        data: wire.data,
        request_id,
    })
}

/// A server→client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Frame {
    /// Reply to a command.
    Response {
        /// Correlation id from the command, when it carried one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        /// Reply payload.
        data: Value,
    },
    /// A backend notification.
    Event {
        /// Opaque notification payload.
        data: Value,
    },
    /// A diagnostic surfaced to the client.
    Log {
        /// Severity.
        level: LogLevel,
        /// Human-readable message.
        message: String,
        /// Correlation id of the command that raised the condition.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

impl Frame {
    /// Acknowledgement for `attach`/`detach`.
    pub fn ack(request_id: Option<RequestId>) -> Self {
        Self::Response {
            request_id,
            data: Value::String("true".to_owned()),
        }
    }

    /// Wire name of the frame.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::Event { .. } => "event",
            Self::Log { .. } => "log",
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
