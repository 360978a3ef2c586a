//! Reconciles the relay's participant count with local session state.
//!
//! The relay's count is ground truth for anything user-facing, even when it
//! disagrees with what the registry currently holds; a disagreement while
//! sessions are still connecting is a normal propagation artifact.

use tracing::{debug, warn};

use crate::presentation::StatusSeverity;

/// Consecutive settled mismatches before the disagreement is worth a
/// warning instead of a debug line.
const MISMATCH_WARN_STREAK: u32 = 2;

#[derive(Debug, Default)]
pub struct PresenceReconciler {
    authoritative_count: u32,
    mismatch_streak: u32,
}

impl PresenceReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the authoritative count unconditionally; the relay is
    /// never locally overridden.
    pub fn observe_count(&mut self, count: u32) {
        if self.authoritative_count != count {
            debug!(from = self.authoritative_count, to = count, "participant count updated");
        }
        self.authoritative_count = count;
    }

    pub fn authoritative_count(&self) -> u32 {
        self.authoritative_count
    }

    /// Derive the room status line from the authoritative count and the
    /// locally observed connected/pending session totals.
    pub fn room_status(&mut self, connected: usize, pending: usize) -> (String, StatusSeverity) {
        let count = self.authoritative_count;
        let local_total = connected + 1; // ourselves

        if pending == 0 && count as usize != local_total && count > 1 {
            self.mismatch_streak += 1;
            if self.mismatch_streak >= MISMATCH_WARN_STREAK {
                warn!(
                    authoritative = count,
                    connected, "participant count disagrees with settled session state"
                );
            } else {
                debug!(authoritative = count, connected, "transient participant count mismatch");
            }
        } else {
            self.mismatch_streak = 0;
        }

        if count <= 1 {
            return (
                "Waiting for others to join...".to_string(),
                StatusSeverity::Connecting,
            );
        }
        if pending > 0 {
            return (
                format!(
                    "Connecting to {} participant{}...",
                    pending,
                    if pending == 1 { "" } else { "s" }
                ),
                StatusSeverity::Connecting,
            );
        }
        (
            format!("{} participants in room", count),
            StatusSeverity::Connected,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alone_in_room() {
        let mut reconciler = PresenceReconciler::new();
        reconciler.observe_count(1);
        let (text, severity) = reconciler.room_status(0, 0);
        assert_eq!(text, "Waiting for others to join...");
        assert_eq!(severity, StatusSeverity::Connecting);
    }

    #[test]
    fn test_connecting_while_sessions_pending() {
        let mut reconciler = PresenceReconciler::new();
        reconciler.observe_count(2);
        let (text, severity) = reconciler.room_status(0, 1);
        assert_eq!(text, "Connecting to 1 participant...");
        assert_eq!(severity, StatusSeverity::Connecting);
    }

    #[test]
    fn test_all_connected_reports_authoritative_count() {
        let mut reconciler = PresenceReconciler::new();
        reconciler.observe_count(2);
        let (text, severity) = reconciler.room_status(1, 0);
        assert_eq!(text, "2 participants in room");
        assert_eq!(severity, StatusSeverity::Connected);
    }

    #[test]
    fn test_count_is_overwritten_unconditionally() {
        let mut reconciler = PresenceReconciler::new();
        reconciler.observe_count(5);
        reconciler.observe_count(2);
        assert_eq!(reconciler.authoritative_count(), 2);
    }

    #[test]
    fn test_settled_mismatch_still_reports_authoritative_count() {
        let mut reconciler = PresenceReconciler::new();
        reconciler.observe_count(3);
        // one connected, none pending: locally 2, relay says 3
        let (text, severity) = reconciler.room_status(1, 0);
        assert_eq!(text, "3 participants in room");
        assert_eq!(severity, StatusSeverity::Connected);
        // the mismatch never becomes a user-facing error on repeat
        let (text, _) = reconciler.room_status(1, 0);
        assert_eq!(text, "3 participants in room");
    }
}
