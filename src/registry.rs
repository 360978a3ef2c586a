//! The session registry: single source of truth for per-peer state.
//!
//! The map is owned exclusively by the call loop task; nothing else ever
//! holds a reference into it, which keeps registry mutation atomic relative
//! to timer cancellation without any locking.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::session::{PeerSession, SessionState};

/// Mapping from remote participant id to its [`PeerSession`].
#[derive(Default)]
pub struct SessionRegistry {
    local_participant_id: Option<String>,
    sessions: HashMap<String, PeerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity the relay assigned to us. Sessions keyed by this
    /// id are rejected at the boundary from then on.
    pub fn set_local_participant(&mut self, participant_id: impl Into<String>) {
        self.local_participant_id = Some(participant_id.into());
    }

    pub fn local_participant(&self) -> Option<&str> {
        self.local_participant_id.as_deref()
    }

    pub fn is_local(&self, participant_id: &str) -> bool {
        self.local_participant() == Some(participant_id)
    }

    /// Idempotent insert: returns the existing session unchanged when
    /// present, otherwise creates a fresh one. Self-referential ids never
    /// enter the map.
    pub fn upsert(&mut self, participant_id: &str) -> Option<&mut PeerSession> {
        if self.is_local(participant_id) {
            warn!(participant = %participant_id, "rejecting self-referential session");
            return None;
        }
        Some(
            self.sessions
                .entry(participant_id.to_string())
                .or_insert_with(|| {
                    debug!(participant = %participant_id, "session created");
                    PeerSession::new(participant_id)
                }),
        )
    }

    pub fn get(&self, participant_id: &str) -> Option<&PeerSession> {
        self.sessions.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(participant_id)
    }

    /// Take a session out of the registry with its timers already
    /// cancelled; the caller releases the transport resources. Removing an
    /// absent participant is a no-op.
    pub fn remove(&mut self, participant_id: &str) -> Option<PeerSession> {
        let mut session = self.sessions.remove(participant_id)?;
        session.cancel_timers();
        debug!(participant = %participant_id, "session removed");
        Some(session)
    }

    /// Empty the registry for room teardown, timers already cancelled.
    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions
            .drain()
            .map(|(_, mut session)| {
                session.cancel_timers();
                session
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently delivering media.
    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Connected)
            .count()
    }

    /// Sessions still working towards connectivity.
    pub fn pending_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state.is_pending())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_is_idempotent() {
        let mut registry = SessionRegistry::new();
        {
            let session = registry.upsert("abc123").unwrap();
            session.retry_count = 2;
        }
        let session = registry.upsert("abc123").unwrap();
        assert_eq!(session.retry_count, 2, "existing session must be returned unchanged");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_self_referential_id_is_rejected() {
        let mut registry = SessionRegistry::new();
        registry.set_local_participant("me-1");
        assert!(registry.upsert("me-1").is_none());
        assert!(registry.is_empty());
        assert!(registry.upsert("abc123").is_some());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut registry = SessionRegistry::new();
        assert!(registry.remove("ghost").is_none());
        registry.upsert("abc123");
        assert!(registry.remove("abc123").is_some());
        assert!(registry.remove("abc123").is_none());
    }

    #[test]
    fn test_counts_by_state() {
        let mut registry = SessionRegistry::new();
        registry.upsert("a");
        registry.upsert("b");
        registry
            .get_mut("b")
            .unwrap()
            .set_state(SessionState::Connected);
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.pending_count(), 1);
    }
}
