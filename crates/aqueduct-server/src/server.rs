//! `BridgeServer`: Axum HTTP + websocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, warn};

use aqueduct_core::backend::Connector;
use aqueduct_logging::connection_span;

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{
    BACKEND_CONNECT_FAILURES_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_HANDSHAKE_REJECTED_TOTAL,
};
use crate::registry::{ConnectionRegistry, ConnectionSlot};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::Connection;
use crate::websocket::multiplexer;
use crate::websocket::socket::FrameSocket;

/// Backend role established by an outer authentication layer.
///
/// Insert it as a request extension ahead of the router; handshakes without
/// one run as the configured anonymous role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedRole(pub String);

/// Shared state accessible from Axum handlers.
pub struct AppState<C> {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Opens one backend connection per client.
    pub connector: Arc<C>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        }
    }
}

/// The event bridge server.
pub struct BridgeServer<C> {
    state: AppState<C>,
}

impl<C: Connector> BridgeServer<C> {
    /// Create a new server.
    pub fn new(config: ServerConfig, connector: C, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            state: AppState {
                config: Arc::new(config),
                connector: Arc::new(connector),
                registry: ConnectionRegistry::new(),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics,
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.ws_path, get(ws_handler::<C>))
            .route("/health", get(health_handler::<C>))
            .route("/metrics", get(metrics_handler::<C>))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the server task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        let app = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
        });

        info!(
            addr = %local,
            ws_path = %self.state.config.ws_path,
            backend = self.state.connector.backend_name(),
            "event bridge listening"
        );
        Ok((local, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET <ws_path>
async fn ws_handler<C: Connector>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    role: Option<Extension<AuthenticatedRole>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(origin = origin.unwrap_or("<none>"), "rejecting handshake from disallowed origin");
        counter!(WS_HANDSHAKE_REJECTED_TOTAL, "reason" => "origin").increment(1);
        return StatusCode::FORBIDDEN.into_response();
    }

    let role = role.map_or_else(|| state.config.anonymous_role.clone(), |Extension(r)| r.0);

    let Some(slot) = state
        .registry
        .try_reserve(&role, state.config.max_connections)
    else {
        warn!(
            max_connections = state.config.max_connections,
            "rejecting handshake, connection limit reached"
        );
        counter!(WS_HANDSHAKE_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(error = %rejection, "websocket upgrade rejected");
            counter!(WS_HANDSHAKE_REJECTED_TOTAL, "reason" => "upgrade").increment(1);
            return rejection.into_response();
        }
    };

    let shutdown = Arc::clone(&state.shutdown);
    upgrade
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| shutdown.track(run_connection(socket, state, slot, role)))
}

/// One client from upgrade to disconnect.
async fn run_connection<C: Connector>(
    mut socket: WebSocket,
    state: AppState<C>,
    slot: ConnectionSlot,
    role: String,
) {
    let span = connection_span(slot.id(), &role);
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(parent: &span, "client connected");

    let reason = match state.connector.connect(&role).instrument(span.clone()).await {
        Ok(backend) => {
            let conn = Connection::new(socket, backend, slot, span);
            multiplexer::run(conn, state.config.heartbeat, state.shutdown.token())
                .await
                .label()
        }
        Err(e) => {
            warn!(parent: &span, error = %e, "backend connection failed, closing socket");
            counter!(BACKEND_CONNECT_FAILURES_TOTAL).increment(1);
            FrameSocket::close(&mut socket).await;
            drop(slot);
            "backend_unavailable"
        }
    };

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// GET /health
async fn health_handler<C: Connector>(State(state): State<AppState<C>>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connector.backend_name(),
        state.registry.count(),
        state.registry.attached_sessions(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler<C: Connector>(State(state): State<AppState<C>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
