//! webrtc-rs backed peer-link primitive

use super::link::{
    LinkConnectionState, LinkEventSink, PeerLinkEvent, PeerLinkFactory, PeerLinkPrimitive,
};
use crate::config::CallConfig;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Creates [`RtcPeerLink`]s using the ICE servers from a [`CallConfig`]
#[derive(Debug, Clone)]
pub struct RtcPeerLinkFactory {
    config: CallConfig,
}

impl RtcPeerLinkFactory {
    /// Create a factory
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerLinkPrimitive>> {
        let link = RtcPeerLink::new(&self.config, events).await?;
        Ok(Arc::new(link))
    }
}

/// Peer link over an `RTCPeerConnection`
pub struct RtcPeerLink {
    generation: u64,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    /// Create a peer connection and route its callbacks to `events`
    #[instrument(skip(config, events), fields(generation = events.generation()))]
    pub async fn new(config: &CallConfig, events: LinkEventSink) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let generation = events.generation();
        register_callbacks(&peer_connection, events);

        info!(generation, "Created peer connection");

        Ok(Self {
            generation,
            peer_connection,
        })
    }

    async fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let local = self.peer_connection.local_description().await.ok_or_else(|| {
            Error::Negotiation("No local description after setting it".to_string())
        })?;

        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }
}

fn register_callbacks(peer_connection: &RTCPeerConnection, events: LinkEventSink) {
    let state_events = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::New => Some(LinkConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(LinkConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(LinkConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(LinkConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(LinkConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(LinkConnectionState::Closed),
                _ => None,
            };
            if let Some(mapped) = mapped {
                state_events.emit(PeerLinkEvent::ConnectionStateChanged(mapped));
            }
            Box::pin(async {})
        },
    ));

    let candidate_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
            candidate_events.emit(PeerLinkEvent::LocalCandidate(IceCandidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
                username_fragment: init.username_fragment,
            }));
        }
        Box::pin(async {})
    }));

    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            match kind {
                Some(kind) => events.emit(PeerLinkEvent::TrackReceived {
                    stream_id: track.stream_id(),
                    track: MediaTrack::new(track.id(), kind),
                }),
                None => debug!("Ignoring remote track of unspecified kind"),
            }
            Box::pin(async {})
        },
    ));
}

#[async_trait]
impl PeerLinkPrimitive for RtcPeerLink {
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<()> {
        let (clock_rate, channels) = match track.kind {
            TrackKind::Audio => (48000, 2),
            TrackKind::Video => (90000, 0),
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: track.kind.mime_type().to_string(),
                clock_rate,
                channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            track.id.clone(),
            stream_id.to_string(),
        ));

        let sender = self
            .peer_connection
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add track {}: {}", track.id, e)))?;

        // RTCP must be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!(generation = self.generation, track_id = %track.id, "Added local track");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        self.local_description(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(Error::Negotiation(
                    "Remote rollback is not supported".to_string(),
                ))
            }
        }
        .map_err(|e| Error::Negotiation(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!(generation = self.generation, "Closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn link() -> RtcPeerLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        RtcPeerLink::new(&CallConfig::default(), LinkEventSink::new(1, tx))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_contains_attached_tracks() {
        let link = link().await;
        link.add_track("local", &MediaTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();
        link.add_track("local", &MediaTrack::new("cam", TrackKind::Video))
            .await
            .unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_links() {
        let offerer = link().await;
        let answerer = link().await;
        offerer
            .add_track("a", &MediaTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        offerer.set_remote_description(answer).await.unwrap();

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_remote_description_is_negotiation_error() {
        let link = link().await;
        let err = link
            .set_remote_description(SessionDescription::answer("not sdp"))
            .await
            .unwrap_err();
        assert!(err.is_negotiation());
        link.close().await.unwrap();
    }
}
