//! The transport capability consumed by the orchestration layer.
//!
//! The engine that performs actual media negotiation, encoding and NAT
//! traversal sits behind these traits. The orchestrator only ever asks it
//! to create sessions, exchange descriptions and candidates, and report
//! events back; everything else about the engine is opaque. A default
//! implementation over the `webrtc` crate lives in [`crate::rtc`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::tiers::IceResourceSet;

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// An SDP description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// A trickled ICE candidate. Field casing matches the RTC dictionary shape
/// the relay forwards verbatim between clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Connectivity of one underlying transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::New => write!(f, "new"),
            ConnectivityState::Connecting => write!(f, "connecting"),
            ConnectivityState::Connected => write!(f, "connected"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
            ConnectivityState::Failed => write!(f, "failed"),
            ConnectivityState::Closed => write!(f, "closed"),
        }
    }
}

/// Opaque handle to a remote participant's media. The orchestrator forwards
/// it to the presentation layer without interpreting it; a renderer that
/// knows the concrete engine can [`downcast`](MediaStream::downcast) it.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            inner,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast().ok()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id).finish()
    }
}

/// Event reported by a transport session, delivered through the sink handed
/// to [`Transport::create_session`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote side.
    IceCandidate(IceCandidate),
    /// First media from the remote side is available.
    RemoteMediaAvailable(MediaStream),
    /// The underlying connectivity changed.
    ConnectivityChanged(ConnectivityState),
}

/// Factory for transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create one transport session using the given NAT-traversal resource
    /// set. Events for the session are delivered through `events`; the
    /// session stops emitting once it is closed.
    async fn create_session(
        &self,
        resources: &IceResourceSet,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportSession>>;
}

/// One peer's underlying transport session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Gate outbound media without renegotiating.
    fn set_media_enabled(&self, mic_on: bool, cam_on: bool);
    /// Release the session's resources. Further events must not be emitted.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_uses_rtc_dictionary_casing() {
        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
        let back: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_description_round_trip() {
        let description = SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\n".to_string(),
        };
        let json = serde_json::to_value(&description).unwrap();
        assert_eq!(json["type"], "offer");
        let back: SessionDescription = serde_json::from_value(json).unwrap();
        assert_eq!(back, description);
    }

    #[test]
    fn test_media_stream_downcast() {
        let stream = MediaStream::new("s1", Arc::new(42u32));
        assert_eq!(stream.id(), "s1");
        assert_eq!(stream.downcast::<u32>().as_deref(), Some(&42));
        assert!(stream.downcast::<String>().is_none());
    }
}
