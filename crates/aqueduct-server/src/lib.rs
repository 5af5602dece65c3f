//! # aqueduct-server
//!
//! Axum HTTP + websocket server for the event bridge.
//!
//! - `GET <ws_path>`: handshake, then one multiplexer task per client that
//!   owns the socket and an exclusive backend connection
//! - `GET /health`: liveness and connection counts
//! - `GET /metrics`: Prometheus text
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{ConnectionError, ServerError, SocketError};
pub use server::{AppState, AuthenticatedRole, BridgeServer};
