//! Per-connection bridge: socket abstraction, connection state, keepalive,
//! the two dispatchers, and the multiplexer loop that drives them.

pub mod commands;
pub mod connection;
pub mod heartbeat;
pub mod multiplexer;
pub mod notifications;
pub mod socket;
