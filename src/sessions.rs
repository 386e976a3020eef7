//! Registry of live sessions, keyed by the client-facing session id.
//!
//! Each entry pairs the handle the HTTP layer needs to deliver client
//! requests with closers for both transports. The relay that owns the
//! transports inserts the entry and removes it again on teardown; routes only
//! look entries up.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. Lookups take a read lock; insert and remove
//! take a write lock. `insert` checks and inserts under the same lock so an id
//! can't be registered twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::transport::{
    sse::SseServerHandle,
    streamable::{StreamableHttpClient, StreamableServerHandle},
    Closer, TransportKind,
};

/// How the HTTP layer reaches the client-facing transport.
#[derive(Clone)]
pub enum ClientHandle {
    Sse(SseServerHandle),
    Streamable(StreamableServerHandle),
}

/// Control surface of the server-facing transport.
#[derive(Clone)]
pub struct ServerControl {
    pub kind: TransportKind,
    pub closer: Closer,
    /// Set for streamable-HTTP servers, which support explicit termination.
    pub remote: Option<Arc<StreamableHttpClient>>,
}

/// One registered client/server transport pair.
#[derive(Clone)]
pub struct SessionPair {
    pub client: ClientHandle,
    pub client_closer: Closer,
    pub server: ServerControl,
    pub created_at: Instant,
}

impl SessionPair {
    fn close(&self) {
        self.client_closer.close();
        self.server.closer.close();
    }
}

/// Why [`SessionRegistry::terminate`] failed.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("Transport not found for sessionId {0}")]
    NotFound(String),
}

/// Shared session map. Cloneable; all clones see the same sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionPair>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pair` under `id`. Returns `false` if the id is taken.
    pub async fn insert(&self, id: &str, pair: SessionPair) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return false;
        }
        info!(session = %id, kind = pair.server.kind.as_str(), "Session registered");
        sessions.insert(id.to_string(), pair);
        true
    }

    pub async fn get(&self, id: &str) -> Option<SessionPair> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove `id` and close both of its transports. Removing an unknown id
    /// is a no-op; returns whether an entry was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(pair) => {
                pair.close();
                info!(
                    session = %id,
                    age_secs = pair.created_at.elapsed().as_secs(),
                    "Session removed"
                );
                true
            }
            None => false,
        }
    }

    /// End a session on request. The pair is removed at once; a
    /// streamable-HTTP server is told to drop its side in the background.
    pub async fn terminate(&self, id: &str) -> Result<(), TerminateError> {
        let removed = self.sessions.write().await.remove(id);
        let pair = removed.ok_or_else(|| TerminateError::NotFound(id.to_string()))?;
        pair.close();
        info!(session = %id, "Session terminated");
        if let Some(remote) = pair.server.remote {
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = remote.terminate_session().await {
                    warn!(session = %id, "Remote session termination failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and drop every session (shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<(String, SessionPair)> = self.sessions.write().await.drain().collect();
        for (id, pair) in drained {
            pair.close();
            info!(session = %id, "Session closed on shutdown");
        }
    }
}
