//! PostgreSQL backend.
//!
//! Every client connection owns one [`PgListener`] on a single-connection
//! pool. The listener carries `LISTEN`/`UNLISTEN` for the attached session,
//! the session lifecycle procedures, and `endpoint.request` calls, so the
//! backend role set at connect time applies to all of them.
//!
//! Errors are classified once, in [`map_sqlx_error`]: statement-level
//! conditions become advisories, anything that compromises the connection is
//! fatal.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{
    PgConnectOptions, PgDatabaseError, PgListener, PgNotification, PgPool, PgPoolOptions,
    PgSeverity,
};
use tracing::{debug, instrument, warn};

use aqueduct_core::backend::{
    ApiRequest, ApiResponse, BackendCall, Connector, Notification, NotificationSource,
    SessionRegistry,
};
use aqueduct_core::errors::BackendError;
use aqueduct_core::ids::SessionId;
use aqueduct_core::protocol::LogLevel;
use aqueduct_settings::DatabaseSettings;

const APPLICATION_NAME: &str = "aqueduct";

/// Opens one [`PgBackend`] per client.
#[derive(Clone, Debug)]
pub struct PgConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnector {
    /// Build a connector from database settings.
    pub fn from_settings(db: &DatabaseSettings) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .database(&db.name)
            .username(&db.user)
            .application_name(APPLICATION_NAME);
        if let Some(password) = &db.password {
            options = options.password(password);
        }
        Self {
            options,
            connect_timeout: Duration::from_millis(db.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgBackend;

    #[instrument(skip(self))]
    async fn connect(&self, role: &str) -> Result<PgBackend, BackendError> {
        // The listener keeps one pooled connection checked out for its lifetime.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect_with(self.options.clone())
            .await
            .map_err(map_sqlx_error)?;
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(map_sqlx_error)?;

        let _ = sqlx::query("select set_config('role', $1, false)")
            .bind(role)
            .execute(&mut listener)
            .await
            .map_err(map_sqlx_error)?;

        debug!(role, "backend connection opened");
        Ok(PgBackend {
            listener,
            _pool: pool,
            pending: VecDeque::new(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// One client's PostgreSQL connection.
pub struct PgBackend {
    listener: PgListener,
    _pool: PgPool,
    pending: VecDeque<PgNotification>,
}

#[async_trait]
impl SessionRegistry for PgBackend {
    async fn attach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
        self.listener
            .listen(session_id.as_str())
            .await
            .map_err(map_sqlx_error)?;
        // Re-notifies every event already queued for the session.
        let _ = sqlx::query("select event.session_attach($1)")
            .bind(session_id.as_str())
            .execute(&mut self.listener)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn detach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
        self.listener
            .unlisten(session_id.as_str())
            .await
            .map_err(map_sqlx_error)?;
        let _ = sqlx::query("select event.session_detach($1)")
            .bind(session_id.as_str())
            .execute(&mut self.listener)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl BackendCall for PgBackend {
    async fn request(&mut self, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
        let row = sqlx::query(
            "select status, message, response, mimetype \
             from endpoint.request($1, $2, $3, $4::json, $5::json)",
        )
        .bind(&request.version)
        .bind(&request.verb)
        .bind(&request.uri)
        .bind(request.query.to_string())
        .bind(request.data.to_string())
        .fetch_optional(&mut self.listener)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Err(BackendError::Advisory {
                level: LogLevel::Error,
                message: format!("endpoint.request returned no rows for {}", request.uri),
            });
        };

        let status: i32 = row.try_get("status").map_err(map_sqlx_error)?;
        Ok(ApiResponse {
            status: u16::try_from(status).unwrap_or(500),
            message: row
                .try_get::<Option<String>, _>("message")
                .map_err(map_sqlx_error)?
                .unwrap_or_default(),
            body: row
                .try_get::<Option<String>, _>("response")
                .map_err(map_sqlx_error)?
                .unwrap_or_default(),
            mimetype: row
                .try_get::<Option<String>, _>("mimetype")
                .map_err(map_sqlx_error)?
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl NotificationSource for PgBackend {
    async fn ready(&mut self) -> Result<(), BackendError> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        // try_recv is cancel-safe; Ok(None) means the connection was lost.
        match self.listener.try_recv().await.map_err(map_sqlx_error)? {
            Some(note) => {
                self.pending.push_back(note);
                Ok(())
            }
            None => Err(BackendError::ConnectionLost(
                "listener connection lost".into(),
            )),
        }
    }

    fn drain(&mut self) -> Vec<Notification> {
        let mut out: Vec<Notification> = self.pending.drain(..).map(to_notification).collect();
        while let Some(note) = self.listener.next_buffered() {
            out.push(to_notification(note));
        }
        out
    }
}

fn to_notification(note: PgNotification) -> Notification {
    Notification::new(SessionId::from(note.channel()), note.payload())
}

/// Classify a driver error as advisory or connection-fatal.
pub fn map_sqlx_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db_err) => {
            let severity = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .map_or(PgSeverity::Error, PgDatabaseError::severity);
            match advisory_level(severity) {
                Some(level) => BackendError::Advisory {
                    level,
                    message: db_err.message().to_owned(),
                },
                None => {
                    warn!(error = db_err.message(), "backend reported fatal condition");
                    BackendError::ConnectionLost(db_err.message().to_owned())
                }
            }
        }
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => BackendError::Advisory {
            level: LogLevel::Error,
            message: err.to_string(),
        },
        sqlx::Error::PoolClosed => BackendError::Closed,
        other => BackendError::ConnectionLost(other.to_string()),
    }
}

/// Log level for a server severity, or `None` when the severity ends the
/// session.
fn advisory_level(severity: PgSeverity) -> Option<LogLevel> {
    match severity {
        PgSeverity::Panic | PgSeverity::Fatal => None,
        PgSeverity::Error => Some(LogLevel::Error),
        PgSeverity::Warning => Some(LogLevel::Warn),
        PgSeverity::Notice | PgSeverity::Info | PgSeverity::Log => Some(LogLevel::Info),
        PgSeverity::Debug => Some(LogLevel::Debug),
    }
}
