//! Orchestration of multi-party real-time call meshes.
//!
//! One [`call::CallContext`] coordinates a room full of direct peer
//! sessions: it drives SDP/ICE exchange over a websocket signaling relay,
//! tracks each remote participant's connection lifecycle with bounded
//! tiered retries, and reconciles the relay's authoritative participant
//! count with locally observed session state. Media transport and
//! rendering stay behind the [`transport`] and [`presentation`] trait
//! boundaries; a default transport over the `webrtc` crate lives in
//! [`rtc`].

pub mod call;
pub mod config;
pub mod error;
pub mod presentation;
pub mod reconcile;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod tiers;
pub mod transport;

pub use call::{CallCommand, CallContext, CallHandle};
pub use config::{CallConfig, CallSettings};
pub use error::{Error, Result};
pub use presentation::{NullPresentation, Presentation, StatusSeverity};
pub use registry::SessionRegistry;
pub use session::{PeerSession, SessionState};
pub use signaling::{ChannelEvent, Envelope, SignalBody, SignalingChannel, Target};
pub use tiers::{IceResourceSet, TierSelector};
pub use transport::{
    ConnectivityState, IceCandidate, MediaStream, SessionDescription, Transport, TransportEvent,
    TransportSession,
};
