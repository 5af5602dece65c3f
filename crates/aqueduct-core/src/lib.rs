//! # aqueduct-core
//!
//! Foundation types shared by every Aqueduct crate:
//!
//! - **Branded IDs**: `SessionId`, `ConnectionId`, `RequestId` as newtypes for type safety
//! - **Wire protocol**: the closed [`protocol::Command`] enum decoded from client
//!   frames and the [`protocol::Frame`] enum encoded back to the client
//! - **Backend capabilities**: the [`backend::SessionRegistry`],
//!   [`backend::BackendCall`] and [`backend::NotificationSource`] traits a
//!   backend connection must provide
//! - **Errors**: `BackendError` and `DecodeError` via `thiserror`

#![deny(unsafe_code)]

pub mod backend;
pub mod errors;
pub mod ids;
pub mod protocol;

pub use backend::{ApiRequest, ApiResponse, Backend, BackendCall, Connector, Notification, NotificationSource, SessionRegistry};
pub use errors::{BackendError, DecodeError};
pub use ids::{ConnectionId, RequestId, SessionId};
pub use protocol::{Command, Decoded, Frame, LogLevel};
