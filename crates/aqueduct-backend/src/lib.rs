//! # aqueduct-backend
//!
//! Implementations of the backend capability traits from `aqueduct-core`:
//!
//! - [`memory`]: an in-process session hub used by tests and `--memory` mode
//! - [`postgres`]: one `sqlx` `PgListener` per client, `LISTEN`/`NOTIFY` for
//!   notifications and stored procedures for attach, detach and requests

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

pub use memory::{MemoryBackend, MemoryConnector, MemoryHub, RequestHandler};
pub use postgres::{PgBackend, PgConnector};
