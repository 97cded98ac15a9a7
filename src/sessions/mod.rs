//! Session registry.
//!
//! [`SessionRegistry`] is the single authority for creating, finding, and
//! tearing down bridge sessions. It enforces `max_sessions`.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. Lookups take a read lock; `create` holds
//! the write lock across the limit check and insert to prevent TOCTOU races.
//! No remote I/O ever happens while the lock is held: teardown removes the
//! entry first and closes the remote connection after the guard is dropped.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::BridgeError;
pub use session::{EnvelopeSink, Session, SessionKind, SessionState};

/// Returned by [`SessionRegistry::create`] when the pool is full. The
/// session is not registered; its channel can still carry the refusal.
pub struct Refused {
    pub session: Arc<Session>,
    pub reason: BridgeError,
}

/// Cloneable; all clones share the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a new `Idle` session writing to `sink`.
    pub async fn create(
        &self,
        kind: SessionKind,
        sink: Box<dyn EnvelopeSink>,
    ) -> Result<Arc<Session>, Refused> {
        let id = format!("{}_{}", kind.prefix(), Uuid::new_v4().simple());
        let session = Arc::new(Session::new(id.clone(), kind, sink));

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(Refused {
                session,
                reason: BridgeError::Policy(format!(
                    "Session limit reached (max {})",
                    self.max_sessions
                )),
            });
        }
        sessions.insert(id.clone(), Arc::clone(&session));
        info!("Session {id} created, total: {}", sessions.len());
        Ok(session)
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove an entry. Returns `None` when it was already gone.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id);
        if removed.is_some() {
            info!("Session {id} removed, remaining: {}", sessions.len());
        }
        removed
    }

    /// Remove the entry and release everything it holds.
    pub async fn teardown(&self, session: &Session) {
        self.remove(session.id()).await;
        session.cleanup().await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Tear down every session (used during shutdown).
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for session in drained {
            session.cleanup().await;
            session.close_channel().await;
        }
        info!("Shut down {count} session(s)");
    }
}
