//! One observer connection: a relay task that writes transcript events to the
//! websocket, and a reader loop that starts sessions on request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::engine::{Services, SessionEngine};
use crate::session::Session;
use crate::telemetry;
use crate::transcript::{EventKind, TranscriptEvent, TranscriptSink};

pub type ConnectionId = Uuid;

/// A running session task and the token that stops it.
pub struct SessionHandle {
    pub session_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<Session>,
}

impl SessionHandle {
    pub fn spawn(engine: SessionEngine, cancel: CancellationToken) -> Self {
        let session_id = engine.session().id;
        let task = tokio::spawn(engine.run());
        Self { session_id, cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session task and return the final session.
    pub async fn join(self) -> Option<Session> {
        self.task.await.ok()
    }
}

/// Live session per connection. At most one handle per connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, SessionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: ConnectionId, handle: SessionHandle) {
        let previous = self.inner.write().await.insert(conn, handle);
        if let Some(p) = previous {
            p.cancel();
        }
    }

    /// Remove and cancel the connection's session, if any.
    pub async fn cancel(&self, conn: ConnectionId) -> Option<SessionHandle> {
        let handle = self.inner.write().await.remove(&conn)?;
        handle.cancel();
        Some(handle)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[derive(Debug, Deserialize)]
struct BeginRequest {
    file_path: String,
}

fn parse_begin(text: &str) -> Result<BeginRequest, String> {
    let req: BeginRequest =
        serde_json::from_str(text).map_err(|e| format!("invalid message, expected {{\"file_path\": ...}}: {e}"))?;
    if req.file_path.trim().is_empty() {
        return Err("invalid message: `file_path` is empty".into());
    }
    Ok(req)
}

struct Connection {
    id: ConnectionId,
    services: Services,
    registry: ConnectionRegistry,
    tx: mpsc::UnboundedSender<TranscriptEvent>,
    cancel: CancellationToken,
}

impl Connection {
    async fn on_text(&self, text: &str) {
        match parse_begin(text) {
            Ok(req) => self.begin(req.file_path).await,
            Err(reason) => {
                warn!(connection_id = %self.id, %reason, "rejected observer message");
                let _ = self.tx.send(TranscriptEvent::text(EventKind::Error, reason));
            }
        }
    }

    /// Start a session for `file_path`, superseding the current one.
    async fn begin(&self, file_path: String) {
        if let Some(previous) = self.registry.cancel(self.id).await {
            info!(connection_id = %self.id, session_id = %previous.session_id, "superseding session");
        }
        let cancel = self.cancel.child_token();
        let sink = TranscriptSink::new(self.tx.clone(), cancel.clone());
        let engine = SessionEngine::new(self.services.clone(), file_path, sink, cancel.clone());
        let handle = SessionHandle::spawn(engine, cancel);
        debug!(connection_id = %self.id, session_id = %handle.session_id, "session spawned");
        self.registry.insert(self.id, handle).await;
    }
}

/// Serve one websocket until the observer goes away, then abort whatever
/// session it was driving.
pub async fn handle_socket(socket: WebSocket, services: Services, registry: ConnectionRegistry) {
    let id = Uuid::new_v4();
    metrics::counter!(telemetry::CONNECTIONS_TOTAL).increment(1);
    info!(connection_id = %id, "observer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<TranscriptEvent>();
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };
            let frame = match event.to_json() {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to encode transcript event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let conn = Connection { id, services, registry: registry.clone(), tx, cancel: cancel.clone() };
    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => conn.on_text(&text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {},
        _ = reader => {},
    }

    cancel.cancel();
    writer.abort();
    info!(connection_id = %id, "observer disconnected");
    if let Some(handle) = registry.cancel(id).await {
        if let Some(session) = handle.join().await {
            debug!(session_id = %session.id, state = session.state.label(), turns = session.history().len(), "session released");
        }
    }
}
