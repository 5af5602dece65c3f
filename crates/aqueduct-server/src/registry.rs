//! Live connection registry.
//!
//! Tracks every open websocket connection and the session it is attached
//! to, for admission control and `/health`. Each entry is owned by a
//! [`ConnectionSlot`] held by the connection itself and is removed when the
//! slot drops, on every exit path.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use aqueduct_core::ids::{ConnectionId, SessionId};

#[derive(Debug)]
struct Entry {
    role: String,
    session: Option<SessionId>,
}

/// Registry of open connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Entry>,
    reserved: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a slot for a new connection, unless `max` are already open.
    pub fn try_reserve(self: &Arc<Self>, role: &str, max: usize) -> Option<ConnectionSlot> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let id = ConnectionId::new();
        let _ = self.entries.insert(
            id.clone(),
            Entry {
                role: role.to_owned(),
                session: None,
            },
        );
        Some(ConnectionSlot {
            id,
            registry: Arc::clone(self),
        })
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Number of distinct sessions attached across all connections.
    pub fn attached_sessions(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| e.session.clone())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Session currently attached by `id`.
    pub fn session_of(&self, id: &ConnectionId) -> Option<SessionId> {
        self.entries.get(id).and_then(|e| e.session.clone())
    }

    /// Role a connection was opened with.
    pub fn role_of(&self, id: &ConnectionId) -> Option<String> {
        self.entries.get(id).map(|e| e.role.clone())
    }

    fn set_session(&self, id: &ConnectionId, session: Option<SessionId>) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.session = session;
        }
    }

    fn release(&self, id: &ConnectionId) {
        if self.entries.remove(id).is_some() {
            let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A connection's entry in the [`ConnectionRegistry`]. Dropping it frees
/// the slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionSlot {
    /// Connection id assigned at reservation.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Record the session this connection is attached to.
    pub fn set_session(&self, session: Option<SessionId>) {
        self.registry.set_session(&self.id, session);
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
