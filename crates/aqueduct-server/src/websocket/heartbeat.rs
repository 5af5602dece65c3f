//! Keepalive timing.
//!
//! The multiplexer owns a [`ticker`]; a tick is the "no source ready" wake.
//! On each tick [`check`] decides between a protocol Ping and closing the
//! connection for lack of any sign of life.

use std::time::Duration;

use tokio::time::{self, Interval, MissedTickBehavior};

/// Keepalive interval and idle timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ticks.
    pub interval: Duration,
    /// Close after this long without any client frame.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// What to do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a protocol Ping.
    Ping,
    /// The client has been silent past the timeout.
    TimedOut,
}

/// Decide the tick action from how long the client has been idle.
pub fn check(idle: Duration, config: &HeartbeatConfig) -> HeartbeatAction {
    if idle >= config.timeout {
        HeartbeatAction::TimedOut
    } else {
        HeartbeatAction::Ping
    }
}

/// Interval whose first tick fires one full period from now.
pub fn ticker(interval: Duration) -> Interval {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
