//! Shared session index with serialized per-session mutation.
//!
//! Every state transition for a session runs under that session's mutex,
//! with its event log emissions inside the critical section. Phase
//! completion checks therefore always see a consistent agent snapshot,
//! and the event feed order matches commit order. Unrelated sessions
//! proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{ConcordError, Result};
use crate::events::EventLog;

use super::model::Session;

struct SessionHandle {
    session: Mutex<Session>,
    events: EventLog,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let id = session.id.clone();
        self.sessions.insert(
            id,
            Arc::new(SessionHandle {
                session: Mutex::new(session),
                events: EventLog::new(),
            }),
        );
    }

    fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| ConcordError::SessionNotFound(session_id.to_string()))
    }

    /// Run `f` with the session's mutex held. The closure gets the event
    /// log so transitions and their events commit atomically.
    pub fn mutate<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session, &EventLog) -> Result<R>,
    ) -> Result<R> {
        let handle = self.handle(session_id)?;
        let mut session = handle.session.lock();
        f(&mut session, &handle.events)
    }

    /// Read-only view under the session mutex.
    pub fn read<R>(&self, session_id: &str, f: impl FnOnce(&Session) -> R) -> Result<R> {
        let handle = self.handle(session_id)?;
        let session = handle.session.lock();
        Ok(f(&session))
    }

    pub fn snapshot(&self, session_id: &str) -> Result<Session> {
        self.read(session_id, |s| s.clone())
    }

    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<(
        Vec<crate::events::SessionEvent>,
        tokio::sync::broadcast::Receiver<crate::events::SessionEvent>,
    )> {
        let handle = self.handle(session_id)?;
        Ok(handle.events.subscribe())
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}
