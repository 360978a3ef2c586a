//! The rendering boundary consumed by the orchestration layer.
//!
//! The orchestrator never touches video elements, spinners or labels
//! directly; it reports participant lifecycle changes through this trait
//! and lets the embedding UI decide what they look like.

use crate::transport::MediaStream;

/// Severity of a room-level status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSeverity {
    Connecting,
    Connected,
    Error,
}

/// Render side effects of session lifecycle events.
pub trait Presentation: Send + Sync {
    /// A participant is known but not yet delivering media (spinner tile).
    fn show_connecting(&self, participant_id: &str, label: &str);

    /// A participant's live media is available (video tile).
    fn show_connected(&self, participant_id: &str, label: &str, stream: &MediaStream);

    /// A participant's remote mic/cam flags changed.
    fn update_media_status(&self, participant_id: &str, mic_on: bool, cam_on: bool);

    /// A participant's tile should be dropped.
    fn remove_participant(&self, participant_id: &str);

    /// The room-level status line changed.
    fn set_room_status(&self, text: &str, severity: StatusSeverity);
}

/// Presentation that renders nothing. Useful for headless embedding and
/// tests that only care about orchestration state.
#[derive(Debug, Default)]
pub struct NullPresentation;

impl Presentation for NullPresentation {
    fn show_connecting(&self, _participant_id: &str, _label: &str) {}
    fn show_connected(&self, _participant_id: &str, _label: &str, _stream: &MediaStream) {}
    fn update_media_status(&self, _participant_id: &str, _mic_on: bool, _cam_on: bool) {}
    fn remove_participant(&self, _participant_id: &str) {}
    fn set_room_status(&self, _text: &str, _severity: StatusSeverity) {}
}
