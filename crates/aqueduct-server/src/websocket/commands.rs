//! Command dispatcher.
//!
//! Executes one decoded [`Command`] against the connection's backend and
//! emits at most one reply frame for it. Advisory backend conditions become
//! a `log` frame; only fatal backend errors and socket failures propagate.

use metrics::counter;
use tracing::{debug, info, warn};

use aqueduct_core::backend::{ApiRequest, Backend};
use aqueduct_core::errors::BackendError;
use aqueduct_core::ids::{RequestId, SessionId};
use aqueduct_core::protocol::{Command, Frame};

use super::connection::Connection;
use super::notifications;
use super::socket::FrameSocket;
use crate::errors::ConnectionError;
use crate::metrics::{BACKEND_ADVISORIES_TOTAL, COMMANDS_TOTAL};

/// Execute `command` on `conn`.
pub async fn dispatch<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    command: Command,
) -> Result<(), ConnectionError> {
    let method = command.method();
    counter!(COMMANDS_TOTAL, "method" => method).increment(1);

    match command {
        Command::Ping => {
            debug!("ping");
            Ok(())
        }
        Command::Attach {
            session_id,
            request_id,
        } => attach(conn, session_id, request_id).await,
        Command::Detach {
            session_id,
            request_id,
        } => detach(conn, session_id, request_id).await,
        Command::Request(request) => request_call(conn, request).await,
    }
}

async fn attach<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    session_id: Option<SessionId>,
    request_id: Option<RequestId>,
) -> Result<(), ConnectionError> {
    let Some(session_id) = session_id else {
        debug!("attach without session id, acknowledging");
        conn.send(Frame::ack(request_id)).await?;
        return Ok(());
    };

    // One session per connection: attaching another session replaces it.
    // An advisory from the implicit detach stays server-side; the client's
    // single reply belongs to the attach.
    if let Some(previous) = conn.session.clone().filter(|s| *s != session_id) {
        conn.set_session(None);
        match conn.backend.detach(&previous).await {
            Ok(()) => {}
            Err(BackendError::Advisory { level, message }) => {
                warn!(
                    previous = %previous,
                    %level,
                    detail = %message,
                    "backend advisory detaching replaced session"
                );
                counter!(BACKEND_ADVISORIES_TOTAL, "method" => "detach").increment(1);
            }
            Err(fatal) => return Err(fatal.into()),
        }
    }

    match conn.backend.attach(&session_id).await {
        Ok(()) => {
            conn.set_session(Some(session_id.clone()));
            info!(session_id = %session_id, "session attached");
            conn.send(Frame::ack(request_id)).await?;
            notifications::flush(conn).await?;
            Ok(())
        }
        Err(err) => report(conn, "attach", err, request_id).await,
    }
}

async fn detach<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    session_id: Option<SessionId>,
    request_id: Option<RequestId>,
) -> Result<(), ConnectionError> {
    let Some(session_id) = session_id else {
        debug!("detach without session id, acknowledging");
        conn.send(Frame::ack(request_id)).await?;
        return Ok(());
    };

    // Interest is dropped locally first so nothing already buffered for the
    // session is delivered, whatever the backend answers.
    if conn.session.as_ref() == Some(&session_id) {
        conn.set_session(None);
    }

    match conn.backend.detach(&session_id).await {
        Ok(()) => {
            info!(session_id = %session_id, "session detached");
            conn.send(Frame::ack(request_id)).await?;
            Ok(())
        }
        Err(err) => report(conn, "detach", err, request_id).await,
    }
}

async fn request_call<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    request: ApiRequest,
) -> Result<(), ConnectionError> {
    debug!(
        verb = %request.verb,
        uri = %request.uri,
        request_id = %request.request_id,
        "proxying request"
    );
    match conn.backend.request(&request).await {
        Ok(response) => {
            debug!(status = response.status, mimetype = %response.mimetype, "request answered");
            conn.send(Frame::Response {
                request_id: Some(request.request_id),
                data: response.data(),
            })
            .await?;
            Ok(())
        }
        Err(err) => report(conn, "request", err, Some(request.request_id)).await,
    }
}

/// Surface an advisory condition as a `log` frame; propagate fatal errors.
async fn report<S: FrameSocket, B: Backend>(
    conn: &mut Connection<S, B>,
    method: &'static str,
    err: BackendError,
    request_id: Option<RequestId>,
) -> Result<(), ConnectionError> {
    match err {
        BackendError::Advisory { level, message } => {
            warn!(method, %level, detail = %message, "backend advisory");
            counter!(BACKEND_ADVISORIES_TOTAL, "method" => method).increment(1);
            conn.send(Frame::Log {
                level,
                message,
                request_id,
            })
            .await?;
            Ok(())
        }
        fatal => Err(fatal.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use serde_json::json;
    use tracing::Span;

    use aqueduct_backend::{MemoryBackend, MemoryHub};
    use aqueduct_core::backend::{
        ApiResponse, BackendCall, Notification, NotificationSource, SessionRegistry,
    };
    use aqueduct_core::protocol::LogLevel;
    use aqueduct_logging::capture_logs;

    use super::super::socket::testing::{ChannelSocket, Outbound, TestClient, pair};
    use super::*;
    use crate::registry::ConnectionRegistry;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    fn rid(s: &str) -> Option<RequestId> {
        Some(RequestId::from(s))
    }

    fn setup(hub: &Arc<MemoryHub>) -> (Connection<ChannelSocket, MemoryBackend>, TestClient) {
        let registry = ConnectionRegistry::new();
        let (socket, client) = pair();
        let conn = Connection::new(
            socket,
            hub.open("anonymous").unwrap(),
            registry.try_reserve("anonymous", 1).unwrap(),
            Span::none(),
        );
        (conn, client)
    }

    fn attach_cmd(session: &str, request: &str) -> Command {
        Command::Attach {
            session_id: Some(sid(session)),
            request_id: rid(request),
        }
    }

    fn api_request(request_id: &str) -> ApiRequest {
        ApiRequest {
            version: "0.3".into(),
            verb: "GET".into(),
            uri: "/relation/widget/widget".into(),
            query: json!({}),
            data: serde_json::Value::Null,
            request_id: RequestId::from(request_id),
        }
    }

    #[tokio::test]
    async fn ping_sends_nothing() {
        let hub = MemoryHub::new();
        let (mut conn, mut client) = setup(&hub);
        dispatch(&mut conn, Command::Ping).await.unwrap();
        assert!(client.sent_so_far().is_empty());
    }

    #[tokio::test]
    async fn attach_acks_then_flushes_queue() {
        let hub = MemoryHub::new();
        for p in [r#"{"a":1}"#, r#"{"a":2}"#, r#"{"a":3}"#] {
            let _ = hub.notify(&sid("42"), p);
        }
        let (mut conn, mut client) = setup(&hub);

        dispatch(&mut conn, attach_cmd("42", "a1")).await.unwrap();

        assert_eq!(
            client.next_json().await,
            json!({"method": "response", "request_id": "a1", "data": "true"})
        );
        for n in 1..=3 {
            assert_eq!(
                client.next_json().await,
                json!({"method": "event", "data": {"a": n}})
            );
        }
        assert_eq!(conn.session(), Some(&sid("42")));
    }

    #[tokio::test]
    async fn attach_without_session_is_acknowledged_noop() {
        let hub = MemoryHub::new();
        let (mut conn, mut client) = setup(&hub);
        dispatch(
            &mut conn,
            Command::Attach {
                session_id: None,
                request_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            client.next_json().await,
            json!({"method": "response", "data": "true"})
        );
        assert!(conn.session().is_none());
    }

    #[tokio::test]
    async fn attaching_another_session_replaces_previous() {
        let hub = MemoryHub::new();
        let (mut conn, mut client) = setup(&hub);
        dispatch(&mut conn, attach_cmd("1", "a1")).await.unwrap();
        dispatch(&mut conn, attach_cmd("2", "a2")).await.unwrap();
        let _ = client.next_json().await;
        let _ = client.next_json().await;

        assert_eq!(conn.session(), Some(&sid("2")));
        assert_eq!(hub.attached_count(&sid("1")), 0);
        assert_eq!(hub.attached_count(&sid("2")), 1);
    }

    /// Memory backend whose `detach` always raises a warning.
    struct WarnOnDetach(MemoryBackend);

    #[async_trait::async_trait]
    impl SessionRegistry for WarnOnDetach {
        async fn attach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
            self.0.attach(session_id).await
        }

        async fn detach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
            self.0.detach(session_id).await?;
            Err(BackendError::warning("session_detach raised"))
        }
    }

    #[async_trait::async_trait]
    impl BackendCall for WarnOnDetach {
        async fn request(&mut self, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
            self.0.request(request).await
        }
    }

    #[async_trait::async_trait]
    impl NotificationSource for WarnOnDetach {
        async fn ready(&mut self) -> Result<(), BackendError> {
            self.0.ready().await
        }

        fn drain(&mut self) -> Vec<Notification> {
            self.0.drain()
        }
    }

    #[tokio::test]
    async fn replacing_session_yields_single_reply_despite_detach_advisory() {
        let (logs, _guard) = capture_logs();
        let hub = MemoryHub::new();
        let registry = ConnectionRegistry::new();
        let (socket, mut client) = pair();
        let mut conn = Connection::new(
            socket,
            WarnOnDetach(hub.open("anonymous").unwrap()),
            registry.try_reserve("anonymous", 1).unwrap(),
            Span::none(),
        );

        dispatch(&mut conn, attach_cmd("1", "a1")).await.unwrap();
        assert_eq!(client.next_json().await["request_id"], "a1");

        dispatch(&mut conn, attach_cmd("2", "a2")).await.unwrap();
        let frames: Vec<serde_json::Value> = client
            .sent_so_far()
            .into_iter()
            .map(|frame| match frame {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            frames,
            vec![json!({"method": "response", "request_id": "a2", "data": "true"})]
        );
        assert_eq!(conn.session(), Some(&sid("2")));
        assert_eq!(hub.attached_count(&sid("1")), 0);
        assert!(logs.has_message("backend advisory detaching replaced session"));
    }

    #[tokio::test]
    async fn detach_twice_both_acknowledged() {
        let hub = MemoryHub::new();
        let (mut conn, mut client) = setup(&hub);
        dispatch(&mut conn, attach_cmd("s", "a")).await.unwrap();
        let _ = client.next_json().await;

        for id in ["d1", "d2"] {
            dispatch(
                &mut conn,
                Command::Detach {
                    session_id: Some(sid("s")),
                    request_id: rid(id),
                },
            )
            .await
            .unwrap();
            assert_eq!(
                client.next_json().await,
                json!({"method": "response", "request_id": id, "data": "true"})
            );
        }
        assert!(conn.session().is_none());
    }

    #[tokio::test]
    async fn request_answers_with_request_id() {
        let hub = MemoryHub::with_handler(Arc::new(
            |req: &ApiRequest| -> Result<ApiResponse, BackendError> {
                Ok(ApiResponse {
                    status: 200,
                    message: "OK".into(),
                    body: json!({"uri": req.uri, "verb": req.verb}).to_string(),
                    mimetype: "application/json".into(),
                })
            },
        ));
        let (mut conn, mut client) = setup(&hub);
        dispatch(&mut conn, Command::Request(api_request("r1")))
            .await
            .unwrap();
        assert_eq!(
            client.next_json().await,
            json!({
                "method": "response",
                "request_id": "r1",
                "data": {"uri": "/relation/widget/widget", "verb": "GET"}
            })
        );
    }

    #[tokio::test]
    async fn advisory_becomes_log_frame() {
        let hub = MemoryHub::with_handler(Arc::new(
            |_req: &ApiRequest| -> Result<ApiResponse, BackendError> {
                Err(BackendError::Advisory {
                    level: LogLevel::Error,
                    message: "permission denied for relation widget".into(),
                })
            },
        ));
        let (mut conn, mut client) = setup(&hub);
        dispatch(&mut conn, Command::Request(api_request("r9")))
            .await
            .unwrap();
        assert_eq!(
            client.next_json().await,
            json!({
                "method": "log",
                "level": "error",
                "message": "permission denied for relation widget",
                "request_id": "r9"
            })
        );
    }

    #[tokio::test]
    async fn fatal_backend_error_propagates() {
        let hub = MemoryHub::new();
        let (mut conn, mut client) = setup(&hub);
        hub.drop_connections();

        let result = dispatch(&mut conn, attach_cmd("s", "a")).await;
        assert_matches!(result, Err(ConnectionError::Backend(BackendError::Closed)));
        assert!(client.sent_so_far().is_empty());
    }
}
