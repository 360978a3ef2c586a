//! Signaling protocol: wire envelopes and the relay channel.
//!
//! Envelopes are JSON objects with a `type` tag, a type-specific `data`
//! payload, the sender's `peer_id` on inbound messages, an optional relay
//! `participants` count, and outbound targeting fields. The channel itself
//! is a websocket bridged to mpsc queues by two pump tasks, so the call
//! loop only ever sees plain messages and a close notification.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{IceCandidate, SessionDescription};

/// Sentinel `target` value for an explicit broadcast to every other client.
pub const TARGET_ALL: &str = "all";

/// A peer's display name, as carried in name announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserName {
    pub name: String,
}

/// A peer's mirrored mic/cam state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub mic_on: bool,
    pub cam_on: bool,
}

/// Identifies the peer a failure report is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPeer {
    pub peer_id: String,
}

/// Typed message body: the `type` tag plus its `data` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignalBody {
    /// Relay acknowledgment of our own join; `peer_id` carries the
    /// identity the relay assigned to us.
    Joined,
    /// Another participant entered the room.
    PeerJoined,
    /// Another participant left the room.
    PeerLeft,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    /// Announce our own display name to the room.
    SetUserName(UserName),
    /// Relay-confirmed name announcement for a peer.
    UserNameSet(UserName),
    UserMediaChanged(MediaFlags),
    /// Advisory only; the payload is opaque to the orchestrator.
    ConnectionQualityWarning(Value),
    /// Reports that the mesh link to `peer_id` was given up on, so the
    /// relay can correct its participant accounting.
    ConnectionFailed(FailedPeer),
}

impl SignalBody {
    /// The wire name of this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Joined => "joined",
            SignalBody::PeerJoined => "peer_joined",
            SignalBody::PeerLeft => "peer_left",
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::IceCandidate(_) => "ice_candidate",
            SignalBody::SetUserName(_) => "set_user_name",
            SignalBody::UserNameSet(_) => "user_name_set",
            SignalBody::UserMediaChanged(_) => "user_media_changed",
            SignalBody::ConnectionQualityWarning(_) => "connection_quality_warning",
            SignalBody::ConnectionFailed(_) => "connection_failed",
        }
    }
}

/// Outbound delivery scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// No targeting field at all; the relay fans out to the rest of the
    /// room.
    Room,
    /// Explicit broadcast sentinel.
    All,
    /// Exactly one recipient.
    Peer(String),
    /// Exactly this ordered subset of recipients.
    Peers(Vec<String>),
}

/// The full wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: SignalBody,
    /// Sender, filled in by the relay on inbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Authoritative participant count, pushed by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<u32>,
    /// Unicast recipient or the [`TARGET_ALL`] sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Multicast recipient list; distinct wire field from `target`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

impl Envelope {
    /// Room broadcast: both targeting fields are dropped from the wire.
    pub fn broadcast(body: SignalBody) -> Self {
        Self::targeted(body, Target::Room)
    }

    /// Unicast to a single peer.
    pub fn to_peer(body: SignalBody, peer_id: impl Into<String>) -> Self {
        Self::targeted(body, Target::Peer(peer_id.into()))
    }

    /// Normalize a delivery scope into the wire fields: a list becomes the
    /// `targets` field, a scalar becomes `target`, the sentinel becomes
    /// `target: "all"`, and a room broadcast carries neither.
    pub fn targeted(body: SignalBody, target: Target) -> Self {
        let (target, targets) = match target {
            Target::Room => (None, None),
            Target::All => (Some(TARGET_ALL.to_string()), None),
            Target::Peer(id) => (Some(id), None),
            Target::Peers(ids) => (None, Some(ids)),
        };
        Self {
            body,
            peer_id: None,
            participants: None,
            target,
            targets,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an inbound payload. Malformed JSON and unrecognized message
    /// types are logged and dropped, never propagated.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                match serde_json::from_str::<Value>(raw) {
                    Ok(value) => {
                        let kind = value
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("<missing>");
                        warn!(%kind, %err, "dropping unrecognized signaling message");
                    }
                    Err(_) => {
                        warn!(%err, "dropping malformed signaling payload");
                    }
                }
                None
            }
        }
    }
}

/// What the channel delivers to the call loop.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Envelope),
    /// The relay connection ended. `clean` is true for a normal close.
    Closed { clean: bool },
}

/// Persistent message channel to the signaling relay.
///
/// Two spawned pumps own the websocket halves; the channel itself is just
/// the mpsc pair bridging them, which also makes it trivial to construct
/// in-memory for tests via [`SignalingChannel::from_parts`].
pub struct SignalingChannel {
    outbound: mpsc::Sender<Envelope>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl SignalingChannel {
    /// Open the websocket at `{endpoint}/{room_id}`. Establishment is
    /// abandoned with a timeout error if the relay does not answer within
    /// `connect_timeout`.
    pub async fn connect(
        endpoint: &str,
        room_id: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), room_id);
        debug!(%url, "connecting to signaling relay");
        let (stream, _) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "signaling relay at {} did not answer within {:?}",
                    url, connect_timeout
                ))
            })??;
        let (mut write, mut read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(64);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(64);

        // Outbound pump: envelope -> JSON text frame.
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                match envelope.encode() {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "dropping unencodable outbound message"),
                }
            }
            let _ = write.close().await;
        });

        // Inbound pump: text frame -> envelope; close -> Closed event.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(raw)) => {
                        if let Some(envelope) = Envelope::decode(&raw) {
                            if event_tx.send(ChannelEvent::Message(envelope)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let clean = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        let _ = event_tx.send(ChannelEvent::Closed { clean }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "signaling read failed");
                        let _ = event_tx.send(ChannelEvent::Closed { clean: false }).await;
                        return;
                    }
                }
            }
            let _ = event_tx.send(ChannelEvent::Closed { clean: false }).await;
        });

        Ok(Self {
            outbound: outbound_tx,
            events: event_rx,
        })
    }

    /// Assemble a channel from raw queue halves. This is how tests (and
    /// embeddings with their own relay link) drive the call loop without a
    /// live websocket.
    pub fn from_parts(
        outbound: mpsc::Sender<Envelope>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self { outbound, events }
    }

    /// Split into the outbound sender and the inbound event queue.
    pub fn split(self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<ChannelEvent>) {
        (self.outbound, self.events)
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| Error::signaling("signaling channel closed"))
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpType;
    use serde_json::json;

    fn offer() -> SignalBody {
        SignalBody::Offer(SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\n".to_string(),
        })
    }

    #[test]
    fn test_unicast_offer_wire_shape() {
        let envelope = Envelope::to_peer(offer(), "abc123");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "data": { "type": "offer", "sdp": "v=0\r\n" },
                "target": "abc123"
            })
        );
    }

    #[test]
    fn test_broadcast_drops_both_targeting_fields() {
        let envelope = Envelope::broadcast(SignalBody::UserMediaChanged(MediaFlags {
            mic_on: false,
            cam_on: true,
        }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("target").is_none());
        assert!(value.get("targets").is_none());
        assert_eq!(value["data"]["mic_on"], false);
    }

    #[test]
    fn test_multicast_normalizes_to_list_field() {
        let envelope = Envelope::targeted(
            offer(),
            Target::Peers(vec!["a".to_string(), "b".to_string()]),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("target").is_none());
        assert_eq!(value["targets"], json!(["a", "b"]));
    }

    #[test]
    fn test_all_sentinel_uses_scalar_field() {
        let envelope = Envelope::targeted(SignalBody::PeerLeft, Target::All);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["target"], TARGET_ALL);
    }

    #[test]
    fn test_decodes_relay_join_ack() {
        let envelope = Envelope::decode(
            r#"{"type":"joined","peer_id":"me-1","participants":1}"#,
        )
        .unwrap();
        assert_eq!(envelope.body, SignalBody::Joined);
        assert_eq!(envelope.peer_id.as_deref(), Some("me-1"));
        assert_eq!(envelope.participants, Some(1));
    }

    #[test]
    fn test_decodes_inbound_candidate() {
        let envelope = Envelope::decode(
            r#"{"type":"ice_candidate","peer_id":"abc123","data":{"candidate":"candidate:0","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match envelope.body {
            SignalBody::IceCandidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_type_is_dropped() {
        assert!(Envelope::decode(r#"{"type":"warp_speed","data":{}}"#).is_none());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        assert!(Envelope::decode("{not json").is_none());
        assert!(Envelope::decode(r#"{"no_type":true}"#).is_none());
    }

    #[test]
    fn test_quality_warning_payload_is_opaque() {
        let envelope = Envelope::decode(
            r#"{"type":"connection_quality_warning","peer_id":"abc123","data":{"packet_loss":0.4,"anything":"goes"}}"#,
        )
        .unwrap();
        match envelope.body {
            SignalBody::ConnectionQualityWarning(value) => {
                assert_eq!(value["packet_loss"], 0.4);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
