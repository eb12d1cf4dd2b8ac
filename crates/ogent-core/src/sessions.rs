//! Live session handles.
//!
//! A session is one transport connection (agent or requester). Each
//! connection registers an outbound frame channel here; the router sends
//! frames by session id without knowing anything about the transport. A
//! closed or missing session surfaces as `NotDeliverable`.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::WireFrame;

/// What kind of peer holds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Agent,
    Requester,
}

struct SessionHandle {
    kind: SessionKind,
    user_id: String,
    tx: mpsc::UnboundedSender<WireFrame>,
}

/// Registry of live connections, keyed by session id.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. The returned receiver is the connection's
    /// outbound frame pump; when the session is closed (or evicted) the
    /// receiver completes and the connection task should shut down.
    pub fn register(
        &self,
        session_id: Uuid,
        kind: SessionKind,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<WireFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id,
            SessionHandle {
                kind,
                user_id: user_id.to_string(),
                tx,
            },
        );
        debug!(session_id = %session_id, kind = ?kind, "session registered");
        rx
    }

    /// Drop a session. Idempotent. Closing the handle ends the receiver,
    /// which terminates the connection's write pump.
    pub fn close(&self, session_id: Uuid) {
        if self.sessions.remove(&session_id).is_some() {
            debug!(session_id = %session_id, "session closed");
        }
    }

    /// Send a frame to a session.
    pub fn send(&self, session_id: Uuid, frame: WireFrame) -> Result<()> {
        let handle = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::NotDeliverable(format!("no session {session_id}")))?;
        handle
            .tx
            .send(frame)
            .map_err(|_| Error::NotDeliverable(format!("session {session_id} is closing")))
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn kind(&self, session_id: Uuid) -> Option<SessionKind> {
        self.sessions.get(&session_id).map(|h| h.kind)
    }

    pub fn user_id(&self, session_id: Uuid) -> Option<String> {
        self.sessions.get(&session_id).map(|h| h.user_id.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
