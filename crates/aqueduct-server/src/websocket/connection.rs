//! Per-client connection state.

use tokio::time::{Duration, Instant};
use tracing::{Span, trace, warn};

use aqueduct_core::backend::Backend;
use aqueduct_core::ids::{ConnectionId, SessionId};
use aqueduct_core::protocol::Frame;

use super::socket::FrameSocket;
use crate::errors::SocketError;
use crate::registry::ConnectionSlot;

/// Lifecycle of a connection.
///
/// `Handshaking → Waiting → (DispatchingCommand | DispatchingNotification)
/// → Waiting → … → Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade accepted, loop not yet entered.
    Handshaking,
    /// Blocked in the joint wait.
    Waiting,
    /// Executing one decoded command.
    DispatchingCommand,
    /// Draining buffered notifications.
    DispatchingNotification,
    /// Resources released.
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: Self) -> bool {
        use ConnectionState::{
            Closed, DispatchingCommand, DispatchingNotification, Handshaking, Waiting,
        };
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Handshaking, Waiting)
            | (Waiting, DispatchingCommand | DispatchingNotification)
            | (DispatchingCommand | DispatchingNotification, Waiting) => true,
            _ => false,
        }
    }
}

/// One client: its socket, its exclusive backend connection, and the session
/// it is attached to. Owned by the multiplexer.
pub struct Connection<S, B> {
    pub(crate) socket: S,
    pub(crate) backend: B,
    pub(crate) session: Option<SessionId>,
    pub(crate) slot: ConnectionSlot,
    pub(crate) span: Span,
    state: ConnectionState,
    last_seen: Instant,
}

impl<S: FrameSocket, B: Backend> Connection<S, B> {
    /// Wrap an upgraded socket and a freshly opened backend connection.
    pub fn new(socket: S, backend: B, slot: ConnectionSlot, span: Span) -> Self {
        Self {
            socket,
            backend,
            session: None,
            slot,
            span,
            state: ConnectionState::Handshaking,
            last_seen: Instant::now(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        self.slot.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Currently attached session, if any.
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition(next) {
            trace!(from = ?self.state, to = ?next, "state transition");
            self.state = next;
        } else if self.state != next {
            warn!(from = ?self.state, to = ?next, "ignoring illegal state transition");
        }
    }

    /// Record a sign of life from the client.
    pub(crate) fn mark_alive(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the last client frame.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub(crate) fn set_session(&mut self, session: Option<SessionId>) {
        if let Some(id) = &session {
            let _ = self.span.record("session_id", id.as_str());
        }
        self.slot.set_session(session.clone());
        self.session = session;
    }

    /// Encode and send one frame.
    pub(crate) async fn send(&mut self, frame: Frame) -> Result<(), SocketError> {
        match frame.encode() {
            Ok(text) => self.socket.send_text(text).await,
            Err(e) => {
                warn!(method = frame.method(), error = %e, "failed to encode frame, dropping");
                Ok(())
            }
        }
    }

    /// Close the socket and enter the terminal state. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.socket.close().await;
        self.transition(ConnectionState::Closed);
    }
}
