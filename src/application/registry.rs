//! Call-ID to session map
//!
//! The one process-wide shared structure. Sharded, so lookups for
//! different calls do not contend; each session guards its own fields.

use crate::application::session::Session;
use crate::domain::shared::value_objects::CallId;
use crate::domain::shared::{Result, SessionError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<CallId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its Call-ID, refusing a duplicate
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyExists(entry.key().to_string())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Session>> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, call_id: &CallId) -> Option<Arc<Session>> {
        self.sessions.remove(call_id).map(|(_, session)| session)
    }

    /// Remove `session` only if it is still the one registered under its
    /// Call-ID
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the live sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}
