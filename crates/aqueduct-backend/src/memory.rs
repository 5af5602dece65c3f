//! In-process backend.
//!
//! [`MemoryHub`] plays the part of the session registry and notification
//! channel. Each client connection gets a [`MemoryBackend`] whose buffer is an
//! unbounded channel fed by the hub. Notifications published for a session
//! with nothing attached are queued on the session and handed to the first
//! connection that attaches it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use aqueduct_core::backend::{
    ApiRequest, ApiResponse, BackendCall, Connector, Notification, NotificationSource,
    SessionRegistry,
};
use aqueduct_core::errors::BackendError;
use aqueduct_core::ids::SessionId;

/// Serves `request` commands for the memory backend.
pub type RequestHandler =
    Arc<dyn Fn(&ApiRequest) -> Result<ApiResponse, BackendError> + Send + Sync>;

#[derive(Default)]
struct SessionState {
    queued: VecDeque<String>,
    attached: HashSet<u64>,
}

struct OpenConnection {
    role: String,
    tx: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, SessionState>,
    connections: HashMap<u64, OpenConnection>,
}

/// Shared session registry and notification channel.
pub struct MemoryHub {
    state: Mutex<HubState>,
    handler: RwLock<RequestHandler>,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryHub {
    /// Create a hub whose request handler answers 404 for everything.
    pub fn new() -> Arc<Self> {
        Self::with_handler(Arc::new(not_found))
    }

    /// Create a hub with a custom request handler.
    pub fn with_handler(handler: RequestHandler) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            handler: RwLock::new(handler),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        })
    }

    /// Replace the request handler.
    pub fn set_handler(&self, handler: RequestHandler) {
        *self.handler.write() = handler;
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Open a backend connection acting as `role`.
    pub fn open(self: &Arc<Self>, role: &str) -> Result<MemoryBackend, BackendError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost(
                "memory hub is not accepting connections".into(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.state.lock().connections.insert(
            id,
            OpenConnection {
                role: role.to_owned(),
                tx,
            },
        );
        debug!(backend_connection = id, role, "memory backend connection opened");
        Ok(MemoryBackend {
            id,
            hub: Arc::clone(self),
            rx,
            pending: VecDeque::new(),
        })
    }

    /// Publish `payload` on `session_id`.
    ///
    /// Returns the number of connections it was delivered to; zero means it
    /// was queued on the session.
    pub fn notify(&self, session_id: &SessionId, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut guard = self.state.lock();
        let HubState {
            sessions,
            connections,
        } = &mut *guard;
        let session = sessions.entry(session_id.clone()).or_default();
        if session.attached.is_empty() {
            session.queued.push_back(payload);
            return 0;
        }
        let mut delivered = 0;
        for id in &session.attached {
            if let Some(conn) = connections.get(id) {
                let note = Notification::new(session_id.clone(), payload.clone());
                if conn.tx.send(note).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Sever every open backend connection. Sessions and queues survive.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        state.connections.clear();
        for session in state.sessions.values_mut() {
            session.attached.clear();
        }
    }

    /// Number of open backend connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Roles of the open backend connections, sorted.
    pub fn connection_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .state
            .lock()
            .connections
            .values()
            .map(|c| c.role.clone())
            .collect();
        roles.sort();
        roles
    }

    /// Number of connections attached to `session_id`.
    pub fn attached_count(&self, session_id: &SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.attached.len())
    }

    /// Number of payloads queued on `session_id`.
    pub fn queued_count(&self, session_id: &SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.queued.len())
    }

    fn attach(&self, id: u64, session_id: &SessionId) -> Result<(), BackendError> {
        let mut guard = self.state.lock();
        let HubState {
            sessions,
            connections,
        } = &mut *guard;
        let conn = connections.get(&id).ok_or(BackendError::Closed)?;
        let session = sessions.entry(session_id.clone()).or_default();
        let _ = session.attached.insert(id);
        for payload in session.queued.drain(..) {
            let _ = conn.tx.send(Notification::new(session_id.clone(), payload));
        }
        Ok(())
    }

    fn detach(&self, id: u64, session_id: &SessionId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&id) {
            return Err(BackendError::Closed);
        }
        if let Some(session) = state.sessions.get_mut(session_id) {
            let _ = session.attached.remove(&id);
        }
        Ok(())
    }

    fn request(&self, id: u64, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
        if !self.state.lock().connections.contains_key(&id) {
            return Err(BackendError::Closed);
        }
        let handler = Arc::clone(&self.handler.read());
        handler(request)
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        let _ = state.connections.remove(&id);
        for session in state.sessions.values_mut() {
            let _ = session.attached.remove(&id);
        }
    }
}

fn not_found(request: &ApiRequest) -> Result<ApiResponse, BackendError> {
    Ok(ApiResponse {
        status: 404,
        message: "Not Found".into(),
        body: serde_json::json!({ "uri": request.uri }).to_string(),
        mimetype: "application/json".into(),
    })
}

/// One client's connection to a [`MemoryHub`].
pub struct MemoryBackend {
    id: u64,
    hub: Arc<MemoryHub>,
    rx: mpsc::UnboundedReceiver<Notification>,
    pending: VecDeque<Notification>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.hub.release(self.id);
    }
}

#[async_trait]
impl SessionRegistry for MemoryBackend {
    async fn attach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
        self.hub.attach(self.id, session_id)
    }

    async fn detach(&mut self, session_id: &SessionId) -> Result<(), BackendError> {
        self.hub.detach(self.id, session_id)
    }
}

#[async_trait]
impl BackendCall for MemoryBackend {
    async fn request(&mut self, request: &ApiRequest) -> Result<ApiResponse, BackendError> {
        self.hub.request(self.id, request)
    }
}

#[async_trait]
impl NotificationSource for MemoryBackend {
    async fn ready(&mut self) -> Result<(), BackendError> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        match self.rx.recv().await {
            Some(note) => {
                self.pending.push_back(note);
                Ok(())
            }
            None => Err(BackendError::Closed),
        }
    }

    fn drain(&mut self) -> Vec<Notification> {
        let mut out: Vec<Notification> = self.pending.drain(..).collect();
        while let Ok(note) = self.rx.try_recv() {
            out.push(note);
        }
        out
    }
}

/// [`Connector`] over a shared [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

impl MemoryConnector {
    /// Connector for `hub`.
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    /// The underlying hub.
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Conn = MemoryBackend;

    async fn connect(&self, role: &str) -> Result<MemoryBackend, BackendError> {
        self.hub.open(role)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
