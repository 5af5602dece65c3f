//! Notification dispatcher.
//!
//! Drains everything currently buffered on the backend connection and sends
//! one `event` frame per notification, in arrival order. Notifications for a
//! session the connection is no longer attached to are dropped here, which
//! is what makes `detach` take effect synchronously.

use metrics::counter;
use tracing::{debug, trace};

use aqueduct_core::backend::Backend;
use aqueduct_core::protocol::Frame;

use super::connection::Connection;
use super::socket::FrameSocket;
use crate::errors::ConnectionError;
use crate::metrics::{NOTIFICATIONS_DELIVERED_TOTAL, NOTIFICATIONS_SUPPRESSED_TOTAL};

/// Deliver every buffered notification. Returns how many were sent.
///
/// Never waits on the backend; an empty buffer is a no-op.
pub async fn flush<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
) -> Result<usize, ConnectionError> {
    let pending = conn.backend.drain();
    if pending.is_empty() {
        trace!("no buffered notifications");
        return Ok(0);
    }

    let mut delivered = 0;
    for note in pending {
        if conn.session.as_ref() != Some(&note.session_id) {
            debug!(session_id = %note.session_id, "dropping notification for detached session");
            counter!(NOTIFICATIONS_SUPPRESSED_TOTAL).increment(1);
            continue;
        }
        conn.send(Frame::Event { data: note.data() }).await?;
        delivered += 1;
    }
    counter!(NOTIFICATIONS_DELIVERED_TOTAL).increment(delivered as u64);
    Ok(delivered)
}
