//! Local session registry: sid -> actor handle for one gateway process

use super::session::SessionHandle;
use courier_core::Sid;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Sid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.sid().clone(), handle);
    }

    pub fn get(&self, sid: &Sid) -> Option<SessionHandle> {
        self.sessions.get(sid).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, sid: &Sid) -> Option<SessionHandle> {
        self.sessions.remove(sid).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Handles of every registered session at this instant
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
