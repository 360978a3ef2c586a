//! Per-peer session records.
//!
//! A [`PeerSession`] is the orchestration-layer record of one remote
//! participant: connection state, retry bookkeeping, buffered candidates,
//! mirrored media flags and the timers currently armed for it. The
//! transitions themselves are driven by the call loop in [`crate::call`].

use std::fmt;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{IceCandidate, MediaStream, TransportSession};

/// Connection lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Known but no attempt started yet.
    New,
    /// We sent an offer and are waiting for the answer.
    OfferPending,
    /// Descriptions are exchanged; waiting for transport connectivity.
    AnswerPending,
    Connected,
    /// A failed attempt was released; the retry delay is running.
    RetryScheduled,
    Failed,
    Closed,
}

impl SessionState {
    /// Whether the session is still working towards connectivity.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::New
                | SessionState::OfferPending
                | SessionState::AnswerPending
                | SessionState::RetryScheduled
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::OfferPending => write!(f, "offer_pending"),
            SessionState::AnswerPending => write!(f, "answer_pending"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::RetryScheduled => write!(f, "retry_scheduled"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Aborts its timer task when dropped, so replacing or discarding a guard
/// is the cancellation.
pub(crate) struct TimerGuard {
    handle: JoinHandle<()>,
}

impl TimerGuard {
    pub(crate) fn spawn<F>(timer: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(timer),
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One remote participant's connection state.
pub struct PeerSession {
    pub participant_id: String,
    /// May arrive after session creation, out of order relative to join.
    pub display_name: Option<String>,
    pub state: SessionState,
    /// Attempts beyond the first; never exceeds the configured cap.
    pub retry_count: u32,
    /// Resource tier of the current attempt.
    pub resource_tier: usize,
    /// Mirrored remote media flags.
    pub mic_on: bool,
    pub cam_on: bool,
    /// Attempt generation. Timers and transport events are stamped with it
    /// so anything outliving its attempt is discarded on arrival.
    pub(crate) epoch: u64,
    pub(crate) transport: Option<Box<dyn TransportSession>>,
    pub(crate) remote_stream: Option<MediaStream>,
    /// Candidates that arrived before the remote description was applied.
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) remote_described: bool,
    pub(crate) deadline_timer: Option<TimerGuard>,
    pub(crate) retry_timer: Option<TimerGuard>,
}

impl PeerSession {
    pub(crate) fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: None,
            state: SessionState::New,
            retry_count: 0,
            resource_tier: 0,
            mic_on: true,
            cam_on: true,
            epoch: 0,
            transport: None,
            remote_stream: None,
            pending_candidates: Vec::new(),
            remote_described: false,
            deadline_timer: None,
            retry_timer: None,
        }
    }

    /// The label shown next to the tile: the display name when known,
    /// otherwise the participant id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.participant_id)
    }

    pub(crate) fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(
                participant = %self.participant_id,
                from = %self.state,
                to = %next,
                "session state"
            );
            self.state = next;
        }
    }

    /// Invalidate everything stamped with the old generation.
    pub(crate) fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub(crate) fn cancel_timers(&mut self) {
        self.deadline_timer = None;
        self.retry_timer = None;
    }

    /// Detach the transport session for release, clearing the negotiation
    /// state that belonged to it.
    pub(crate) fn take_transport(&mut self) -> Option<Box<dyn TransportSession>> {
        self.remote_described = false;
        self.pending_candidates.clear();
        self.remote_stream = None;
        self.transport.take()
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("participant_id", &self.participant_id)
            .field("display_name", &self.display_name)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("resource_tier", &self.resource_tier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = PeerSession::new("abc123");
        assert_eq!(session.state, SessionState::New);
        assert_eq!(session.retry_count, 0);
        assert!(session.mic_on && session.cam_on);
        assert_eq!(session.label(), "abc123");
    }

    #[test]
    fn test_label_prefers_display_name() {
        let mut session = PeerSession::new("abc123");
        session.display_name = Some("Ana".to_string());
        assert_eq!(session.label(), "Ana");
    }

    #[test]
    fn test_pending_and_terminal_states() {
        assert!(SessionState::New.is_pending());
        assert!(SessionState::OfferPending.is_pending());
        assert!(SessionState::AnswerPending.is_pending());
        assert!(SessionState::RetryScheduled.is_pending());
        assert!(!SessionState::Connected.is_pending());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
    }
}
