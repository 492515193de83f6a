use dashmap::DashMap;
use futures::future::join_all;
use tracing::{info, warn};

use super::{
    session::{SessionActor, SessionHandle, SessionServices},
    track::SessionKey,
};

/// Process-wide map from session key to its actor.
///
/// Sessions are created on first use and live until the process exits.
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionHandle>,
    services: SessionServices,
}

impl SessionRegistry {
    pub fn new(services: SessionServices) -> Self {
        Self {
            sessions: DashMap::new(),
            services,
        }
    }

    /// Returns the session for `key`, spawning it if needed. Concurrent
    /// callers for the same key always get the same actor.
    pub fn get_or_create(&self, key: SessionKey) -> SessionHandle {
        if let Some(handle) = self.sessions.get(&key) {
            return handle.clone();
        }

        self.sessions
            .entry(key)
            .or_insert_with(|| {
                info!(session = %key, "🆕 Creating session");
                SessionActor::spawn(key, &self.services)
            })
            .clone()
    }

    pub fn get(&self, key: SessionKey) -> Option<SessionHandle> {
        self.sessions.get(&key).map(|h| h.clone())
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Saves every session's queue; returns how many were saved.
    pub async fn persist_all(&self) -> usize {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|handle| handle.persist())).await;

        let mut saved = 0;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(()) => saved += 1,
                Err(e) => warn!(session = %handle.key(), "⚠️ Could not save queue: {}", e),
            }
        }
        info!("💾 Saved {} of {} session queues", saved, handles.len());
        saved
    }
}
