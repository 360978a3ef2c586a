//! Default transport implementation over the `webrtc` crate.
//!
//! This is a thin boundary module: it builds peer connections from a
//! resource set, bridges the engine's callbacks into the event queue the
//! orchestrator hands it, and translates between wire dictionaries and the
//! engine's native types. No orchestration decisions are made here.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::tiers::IceResourceSet;
use crate::transport::{
    ConnectivityState, IceCandidate, MediaStream, SdpType, SessionDescription, Transport,
    TransportEvent, TransportSession,
};

fn transport_err(err: webrtc::Error) -> Error {
    Error::transport(err.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::New,
    }
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(transport_err)
}

/// [`Transport`] backed by `webrtc-rs`.
#[derive(Debug, Default)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_session(
        &self,
        resources: &IceResourceSet,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportSession>> {
        let session = WebRtcSession::open(resources, events).await?;
        Ok(Box::new(session))
    }
}

/// One peer connection with its local tracks.
pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    mic_enabled: AtomicBool,
    cam_enabled: AtomicBool,
}

impl WebRtcSession {
    /// Build a peer connection configured with the given ICE endpoints and
    /// wire its callbacks into `events`.
    pub async fn open(
        resources: &IceResourceSet,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_err)?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: resources.urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await.map_err(transport_err)?);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "mesh-call".to_owned(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "mesh-call".to_owned(),
        ));
        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_err)?;
        peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_err)?;

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events
                            .send(TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(err) => debug!(%err, "discarding unserializable candidate"),
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let stream = MediaStream::new(
                        track.ssrc().to_string(),
                        track as Arc<dyn Any + Send + Sync>,
                    );
                    let _ = events
                        .send(TransportEvent::RemoteMediaAvailable(stream))
                        .await;
                })
            },
        ));

        let state_events = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    let _ = events
                        .send(TransportEvent::ConnectivityChanged(map_state(state)))
                        .await;
                })
            },
        ));

        Ok(Self {
            peer_connection,
            audio_track,
            video_track,
            mic_enabled: AtomicBool::new(true),
            cam_enabled: AtomicBool::new(true),
        })
    }

    /// Local audio track; the capture pipeline writes samples into it and
    /// is expected to consult [`media_enabled`](Self::media_enabled).
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    /// Local video track, same contract as [`audio_track`](Self::audio_track).
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    /// Current (mic, cam) gating flags.
    pub fn media_enabled(&self) -> (bool, bool) {
        (
            self.mic_enabled.load(Ordering::Relaxed),
            self.cam_enabled.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(transport_err)?;
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(transport_err)?;
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(&description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(transport_err)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(&description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(transport_err)
    }

    fn set_media_enabled(&self, mic_on: bool, cam_on: bool) {
        self.mic_enabled.store(mic_on, Ordering::Relaxed);
        self.cam_enabled.store(cam_on, Ordering::Relaxed);
        debug!(mic_on, cam_on, "outbound media gating updated");
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await.map_err(transport_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            ConnectivityState::Connected
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            ConnectivityState::Failed
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Unspecified),
            ConnectivityState::New
        );
    }
}
