//! Connection multiplexer.
//!
//! One cooperative task per client. Each iteration waits jointly on the
//! client socket, the backend connection, the keepalive ticker and the
//! server shutdown token, then services exactly the source that woke it:
//!
//! - socket frame → decode → command dispatcher → at most one reply
//! - backend readiness → notification dispatcher → one `event` per notification
//! - tick → keepalive Ping, or close when the client has gone silent
//!
//! The loop ends on socket closure, socket error, fatal backend error,
//! keepalive timeout, shutdown, or a panic in a dispatcher. The socket and
//! backend connection are released on every one of those paths.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

use aqueduct_core::backend::Backend;
use aqueduct_core::errors::BackendError;
use aqueduct_core::protocol::{self, Decoded};

use super::commands;
use super::connection::{Connection, ConnectionState};
use super::heartbeat::{self, HeartbeatAction, HeartbeatConfig};
use super::notifications;
use super::socket::{FrameSocket, Inbound};
use crate::errors::{ConnectionError, SocketError};
use crate::metrics::{MALFORMED_FRAMES_TOTAL, UNRECOGNIZED_FRAMES_TOTAL};

/// Why a connection loop ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The client closed the socket.
    ClientClosed,
    /// No sign of life within the keepalive timeout.
    HeartbeatTimeout,
    /// The server is shutting down.
    Shutdown,
    /// Socket failure, fatal backend error, or a panic.
    Failed(ConnectionError),
}

impl CloseReason {
    /// Short label for logging/metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::Failed(e) => e.error_kind(),
        }
    }
}

enum Wake {
    Shutdown,
    Socket(Option<Result<Inbound, SocketError>>),
    Backend(Result<(), BackendError>),
    Tick,
}

/// Run `conn` until it closes, then release it.
pub async fn run<S: FrameSocket, B: Backend>(
    mut conn: Connection<S, B>,
    heartbeat: HeartbeatConfig,
    shutdown: CancellationToken,
) -> CloseReason {
    let span = conn.span.clone();
    async move {
        let outcome = AssertUnwindSafe(serve(&mut conn, heartbeat, &shutdown))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(reason) => reason,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "connection loop panicked");
                CloseReason::Failed(ConnectionError::Panicked(message))
            }
        };
        conn.close().await;
        match &reason {
            CloseReason::Failed(err) => warn!(reason = reason.label(), error = %err, "connection closed"),
            _ => info!(reason = reason.label(), "connection closed"),
        }
        reason
    }
    .instrument(span)
    .await
}

async fn serve<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    heartbeat: HeartbeatConfig,
    shutdown: &CancellationToken,
) -> CloseReason {
    let mut ticker = heartbeat::ticker(heartbeat.interval);
    let mut backend_first = false;
    conn.transition(ConnectionState::Waiting);

    loop {
        // Shutdown always wins; socket and backend take turns going first so
        // a busy client cannot hold back notifications, nor the reverse.
        let wake = if backend_first {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => Wake::Shutdown,
                ready = conn.backend.ready() => Wake::Backend(ready),
                frame = conn.socket.recv() => Wake::Socket(frame),
                _ = ticker.tick() => Wake::Tick,
            }
        } else {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => Wake::Shutdown,
                frame = conn.socket.recv() => Wake::Socket(frame),
                ready = conn.backend.ready() => Wake::Backend(ready),
                _ = ticker.tick() => Wake::Tick,
            }
        };
        backend_first = !backend_first;

        let step = match wake {
            Wake::Shutdown => return CloseReason::Shutdown,
            Wake::Socket(None | Some(Ok(Inbound::Close))) => return CloseReason::ClientClosed,
            Wake::Socket(Some(Err(e))) => return CloseReason::Failed(e.into()),
            Wake::Socket(Some(Ok(frame))) => on_frame(conn, frame).await,
            Wake::Backend(Ok(())) => {
                conn.transition(ConnectionState::DispatchingNotification);
                let result = notifications::flush(conn).await.map(|_| ());
                conn.transition(ConnectionState::Waiting);
                result
            }
            Wake::Backend(Err(e)) => return CloseReason::Failed(e.into()),
            Wake::Tick => match heartbeat::check(conn.idle_for(), &heartbeat) {
                HeartbeatAction::TimedOut => {
                    warn!(idle = ?conn.idle_for(), "client unresponsive, disconnecting");
                    return CloseReason::HeartbeatTimeout;
                }
                HeartbeatAction::Ping => {
                    trace!("keepalive ping");
                    conn.socket.send_ping().await.map_err(ConnectionError::from)
                }
            },
        };

        if let Err(e) = step {
            return CloseReason::Failed(e);
        }
    }
}

async fn on_frame<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    frame: Inbound,
) -> Result<(), ConnectionError> {
    conn.mark_alive();
    let text = match frame {
        Inbound::Text(text) => text,
        Inbound::Binary(data) => match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(len = e.as_bytes().len(), "discarding non-UTF-8 binary frame");
                counter!(MALFORMED_FRAMES_TOTAL).increment(1);
                return Ok(());
            }
        },
        Inbound::Ping | Inbound::Pong | Inbound::Close => return Ok(()),
    };

    match protocol::decode(&text) {
        Decoded::Empty => Ok(()),
        Decoded::Malformed(e) => {
            warn!(error = %e, "discarding malformed frame");
            counter!(MALFORMED_FRAMES_TOTAL).increment(1);
            Ok(())
        }
        Decoded::Unrecognized { method } => {
            info!(method = %method, "ignoring unrecognized method");
            counter!(UNRECOGNIZED_FRAMES_TOTAL).increment(1);
            Ok(())
        }
        Decoded::Command(command) => {
            if !matches!(command, protocol::Command::Ping) {
                debug!(method = command.method(), "command received");
            }
            conn.transition(ConnectionState::DispatchingCommand);
            let result = commands::dispatch(conn, command).await;
            conn.transition(ConnectionState::Waiting);
            result
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::task::JoinHandle;
    use tracing::Span;

    use aqueduct_backend::MemoryHub;
    use aqueduct_core::backend::{ApiRequest, ApiResponse};
    use aqueduct_core::ids::SessionId;
    use aqueduct_logging::capture_logs;

    use super::super::socket::testing::{Outbound, TestClient, pair};
    use super::*;
    use crate::registry::ConnectionRegistry;

    struct Harness {
        client: TestClient,
        hub: Arc<MemoryHub>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
        task: JoinHandle<CloseReason>,
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    fn start_with(hub: Arc<MemoryHub>, heartbeat: HeartbeatConfig) -> Harness {
        let registry = ConnectionRegistry::new();
        let (socket, client) = pair();
        let conn = Connection::new(
            socket,
            hub.open("anonymous").unwrap(),
            registry.try_reserve("anonymous", 10).unwrap(),
            Span::none(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(conn, heartbeat, shutdown.clone()));
        Harness {
            client,
            hub,
            registry,
            shutdown,
            task,
        }
    }

    fn start(hub: Arc<MemoryHub>) -> Harness {
        start_with(hub, HeartbeatConfig::default())
    }

    async fn finish(task: JoinHandle<CloseReason>) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn attach_then_detach_suppresses_notifications() {
        let mut h = start(MemoryHub::new());
        h.client
            .send_json(&json!({"method": "attach", "session_id": "S", "request_id": "a"}));
        assert_eq!(h.client.next_json().await["request_id"], "a");

        h.client
            .send_json(&json!({"method": "detach", "session_id": "S", "request_id": "d"}));
        assert_eq!(h.client.next_json().await["request_id"], "d");

        let _ = h.hub.notify(&sid("S"), "late");
        h.client.send_json(&json!({"method": "ping"}));
        h.client
            .send_json(&json!({"method": "detach", "session_id": "S", "request_id": "marker"}));
        assert_eq!(h.client.next_json().await["request_id"], "marker");
        assert!(h.client.sent_so_far().is_empty());

        h.client.hang_up();
        assert_matches!(finish(h.task).await, CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn attach_flushes_queued_events_after_ack() {
        let hub = MemoryHub::new();
        for n in 1..=3 {
            let _ = hub.notify(&sid("42"), json!({"a": n}).to_string());
        }
        let mut h = start(hub);
        h.client
            .send_json(&json!({"method": "attach", "session_id": "42", "request_id": "r"}));

        assert_eq!(
            h.client.next_json().await,
            json!({"method": "response", "request_id": "r", "data": "true"})
        );
        for n in 1..=3 {
            assert_eq!(
                h.client.next_json().await,
                json!({"method": "event", "data": {"a": n}})
            );
        }
        assert_eq!(h.registry.attached_sessions(), 1);
    }

    #[tokio::test]
    async fn ping_never_replies() {
        let mut h = start(MemoryHub::new());
        h.client.send_json(&json!({"method": "ping"}));
        h.client.send_json(&json!({"method": "ping"}));
        h.client
            .send_json(&json!({"method": "attach", "session_id": null, "request_id": "x"}));
        assert_eq!(h.client.next_json().await["request_id"], "x");
        assert!(h.client.sent_so_far().is_empty());
    }

    #[tokio::test]
    async fn request_reply_is_correlated_amid_notifications() {
        let hub = MemoryHub::with_handler(Arc::new(
            |req: &ApiRequest| -> Result<ApiResponse, BackendError> {
                Ok(ApiResponse {
                    status: 200,
                    message: "OK".into(),
                    body: json!({"echo": req.uri}).to_string(),
                    mimetype: "application/json".into(),
                })
            },
        ));
        let mut h = start(hub);
        h.client
            .send_json(&json!({"method": "attach", "session_id": "s", "request_id": "a"}));
        let _ = h.client.next_json().await;

        for n in 0..5 {
            let _ = h.hub.notify(&sid("s"), json!({"n": n}).to_string());
        }
        h.client.send_json(&json!({
            "method": "request",
            "verb": "GET",
            "uri": "/widget",
            "query": {},
            "data": null,
            "request_id": "r1"
        }));

        let mut responses = 0;
        let mut events = 0;
        while responses == 0 || events < 5 {
            let frame = h.client.next_json().await;
            match frame["method"].as_str() {
                Some("response") => {
                    assert_eq!(frame["request_id"], "r1");
                    assert_eq!(frame["data"], json!({"echo": "/widget"}));
                    responses += 1;
                }
                Some("event") => events += 1,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(responses, 1);
        assert!(h.client.sent_so_far().is_empty());
    }

    #[tokio::test]
    async fn busy_client_does_not_starve_notifications() {
        let mut h = start(MemoryHub::new());
        h.client
            .send_json(&json!({"method": "attach", "session_id": "s", "request_id": "a"}));
        let _ = h.client.next_json().await;

        let _ = h.hub.notify(&sid("s"), "buffered");
        for n in 0..200 {
            h.client.send_json(&json!({
                "method": "request",
                "verb": "GET",
                "uri": "/widget",
                "request_id": format!("r{n}")
            }));
        }

        let mut position = None;
        for index in 0..201 {
            let frame = h.client.next_json().await;
            if frame["method"] == "event" {
                assert_eq!(frame["data"], "buffered");
                position = Some(index);
            }
        }
        assert_matches!(position, Some(index) if index <= 1);
    }

    #[tokio::test]
    async fn malformed_frames_keep_connection_open() {
        let (logs, _guard) = capture_logs();
        let mut h = start(MemoryHub::new());
        h.client.send_text("this is not json");
        h.client.send_text("[1, 2, 3]");
        h.client.send_text("");
        h.client.send_json(&json!({"method": "subscribe", "channel": "x"}));
        h.client.send(Inbound::Binary(vec![0xff, 0xfe]));
        h.client
            .send_json(&json!({"method": "attach", "session_id": null, "request_id": "ok"}));

        assert_eq!(h.client.next_json().await["request_id"], "ok");
        assert!(h.client.sent_so_far().is_empty());
        assert!(!h.task.is_finished());
        assert!(logs.has_message("discarding malformed frame"));
        assert!(logs.has_message("ignoring unrecognized method"));
    }

    #[tokio::test]
    async fn binary_text_frames_are_decoded() {
        let mut h = start(MemoryHub::new());
        let frame = json!({"method": "attach", "session_id": "b", "request_id": "bin"});
        h.client.send(Inbound::Binary(frame.to_string().into_bytes()));
        assert_eq!(h.client.next_json().await["request_id"], "bin");
    }

    #[tokio::test]
    async fn backend_loss_ends_loop_and_releases_registry() {
        let mut h = start(MemoryHub::new());
        h.client
            .send_json(&json!({"method": "attach", "session_id": "42", "request_id": "a"}));
        let _ = h.client.next_json().await;

        h.hub.drop_connections();

        let reason = finish(h.task).await;
        assert_matches!(
            reason,
            CloseReason::Failed(ConnectionError::Backend(BackendError::Closed))
        );
        assert_eq!(h.client.next().await, Some(Outbound::Close));
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn socket_error_ends_loop() {
        let h = start(MemoryHub::new());
        h.client.fail("connection reset");
        assert_matches!(
            finish(h.task).await,
            CloseReason::Failed(ConnectionError::Socket(_))
        );
        assert_eq!(h.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn close_frame_ends_loop() {
        let h = start(MemoryHub::new());
        h.client.send(Inbound::Close);
        assert_matches!(finish(h.task).await, CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn shutdown_ends_loop() {
        let mut h = start(MemoryHub::new());
        h.shutdown.cancel();
        assert_matches!(finish(h.task).await, CloseReason::Shutdown);
        assert_eq!(h.client.next().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn panic_in_dispatcher_is_contained() {
        let hub = MemoryHub::with_handler(Arc::new(
            |_req: &ApiRequest| -> Result<ApiResponse, BackendError> {
                panic!("handler exploded")
            },
        ));
        let mut h = start(hub);
        h.client.send_json(&json!({
            "method": "request", "verb": "GET", "uri": "/", "request_id": "p"
        }));

        let reason = finish(h.task).await;
        assert_matches!(reason, CloseReason::Failed(ConnectionError::Panicked(msg)) if msg.contains("exploded"));
        assert_eq!(h.client.next().await, Some(Outbound::Close));
        assert_eq!(h.hub.connection_count(), 0);
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_then_times_out() {
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(25),
        };
        let mut h = start_with(MemoryHub::new(), heartbeat);

        // Ticks at 10s and 20s ping; the tick at 30s finds the client idle.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.task.is_finished());
        assert_matches!(finish(h.task).await, CloseReason::HeartbeatTimeout);
        assert_eq!(
            h.client.sent_so_far(),
            vec![Outbound::Ping, Outbound::Ping, Outbound::Close]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn client_activity_keeps_connection_alive() {
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(25),
        };
        let mut h = start_with(MemoryHub::new(), heartbeat);

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            h.client.send(Inbound::Pong);
        }
        assert!(!h.task.is_finished());
        let _ = h.client.sent_so_far();
        h.client.hang_up();
        assert_matches!(finish(h.task).await, CloseReason::ClientClosed);
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::ClientClosed.label(), "client_closed");
        assert_eq!(CloseReason::Shutdown.label(), "shutdown");
        assert_eq!(
            CloseReason::Failed(ConnectionError::Panicked("x".into())).label(),
            "panic"
        );
    }
}
