//! Session registry: binds session ids to live streaming connections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::protocol::JsonRpcResponse;

/// Server-to-client push side of a session, independent of the transport.
#[async_trait::async_trait]
pub trait SessionConnection: Send + Sync {
    /// Queue a message for delivery to the client.
    fn send(&self, message: &JsonRpcResponse) -> Result<()>;

    /// Whether the client side has gone away.
    fn is_closed(&self) -> bool;

    /// Completes once the client side has gone away or [`close`] was called.
    ///
    /// [`close`]: SessionConnection::close
    async fn closed(&self);

    /// End the stream from the server side. Later sends fail.
    fn close(&self);
}

/// One live streaming connection.
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// Push handle.
    pub connection: Arc<dyn SessionConnection>,
    /// When the stream was opened.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Concurrent map of live sessions.
///
/// Entries are added when a stream opens and removed by whichever path sees
/// it close first: the stream being dropped, a gateway stop, or a lookup
/// that finds the connection already closed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `connection`. Fails if the id is already live.
    pub fn register(
        &self,
        id: impl Into<String>,
        connection: Arc<dyn SessionConnection>,
    ) -> Result<Arc<Session>> {
        let id = id.into();
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::Internal(format!("session {id} already registered"))),
            Entry::Vacant(slot) => {
                let session = Arc::new(Session {
                    id,
                    connection,
                    created_at: Utc::now(),
                });
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Find a live session.
    pub fn lookup(&self, id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        if session.connection.is_closed() {
            self.sessions
                .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(session)
    }

    /// Remove a session. Returns it if it was registered.
    pub fn unregister(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Close and remove every session, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let mut count = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.connection.close();
                count += 1;
            }
        }
        count
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
