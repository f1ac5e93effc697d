//! Registry of live sessions.
//!
//! `SessionRegistry` stores non-owning weak references to [`Session`]s so
//! that process-level tasks can reach live connections without keeping them
//! alive. Dead entries are pruned opportunistically or lazily at lookup time.

use std::{
    fmt,
    sync::{
        Arc,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tracing::info;

use super::Session;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Allocate the next process-unique identifier.
    #[must_use]
    pub fn next() -> Self { Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)) }

    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "conn-{}", self.0) }
}

/// Concurrent map of sessions keyed by [`ConnectionId`].
#[derive(Default)]
pub struct SessionRegistry(DashMap<ConnectionId, Weak<Session>>);

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Retrieve the session for `id` if it is still alive.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        let guard = self.0.get(id);
        let session = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if session.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        session
    }

    /// Track a newly established session under its own identifier.
    pub fn insert(&self, session: &Arc<Session>) {
        self.0.insert(session.id(), Arc::downgrade(session));
    }

    /// Stop tracking a session, typically on connection teardown.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Remove every stale weak reference.
    ///
    /// `DashMap::retain` takes per-bucket write locks, so other operations
    /// may contend briefly while the registry is pruned.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale references, then return the identifiers of live sessions.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    /// Prune stale references, then collect the live sessions.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = Vec::with_capacity(self.0.len());
        self.0.retain(|_, weak| match weak.upgrade() {
            Some(session) => {
                sessions.push(session);
                true
            }
            None => false,
        });
        sessions
    }

    /// Close every live session and empty the registry.
    ///
    /// Returns the number of sessions closed.
    pub async fn close_all(&self) -> usize {
        let sessions = self.active_sessions();
        self.0.clear();
        for session in &sessions {
            session.close().await;
        }
        info!(closed = sessions.len(), "closed all sessions");
        sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
