use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    IceConnectivity, MediaKind, PeerConnectivity, PeerTransport, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::media::LocalTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates one `RTCPeerConnection` per match session.
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        install_handlers(&pc, sink);
        let transport: Arc<dyn PeerTransport> = Arc::new(WebRtcTransport {
            pc,
            closed: AtomicBool::new(false),
        });
        Ok(transport)
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, sink: TransportEventSink) {
    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::trace!(generation = sink.generation(), "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => match serde_json::to_string(&init) {
                    Ok(json) => sink.emit(TransportEvent::LocalCandidate(json)),
                    Err(err) => tracing::warn!(error = %err, "failed to encode local candidate"),
                },
                Err(err) => tracing::warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let ice_sink = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = ice_sink.clone();
        Box::pin(async move {
            tracing::debug!(generation = sink.generation(), ?state, "ice connection state");
            if let Some(state) = map_ice_state(state) {
                sink.emit(TransportEvent::IceState(state));
            }
        })
    }));

    let peer_sink = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = peer_sink.clone();
        Box::pin(async move {
            tracing::debug!(generation = sink.generation(), ?state, "peer connection state");
            if let Some(state) = map_peer_state(state) {
                sink.emit(TransportEvent::PeerState(state));
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                other => {
                    tracing::debug!(?other, "ignoring remote track of unknown kind");
                    return;
                }
            };
            sink.emit(TransportEvent::RemoteTrack {
                kind,
                track_id: track.id(),
                stream_id: track.stream_id(),
            });
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectivity> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectivity::New,
        RTCIceConnectionState::Checking => IceConnectivity::Checking,
        RTCIceConnectionState::Connected => IceConnectivity::Connected,
        RTCIceConnectionState::Completed => IceConnectivity::Completed,
        RTCIceConnectionState::Disconnected => IceConnectivity::Disconnected,
        RTCIceConnectionState::Failed => IceConnectivity::Failed,
        RTCIceConnectionState::Closed => IceConnectivity::Closed,
        _ => return None,
    })
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerConnectivity> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectivity::New,
        RTCPeerConnectionState::Connecting => PeerConnectivity::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectivity::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectivity::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectivity::Failed,
        RTCPeerConnectionState::Closed => PeerConnectivity::Closed,
        _ => return None,
    })
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|err| TransportError::Malformed(err.to_string()))
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn add_placeholder(&self, kind: MediaKind) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            send_encodings: vec![],
        };
        self.pc
            .add_transceiver_from_kind(codec_type(kind), Some(init))
            .await?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|err| TransportError::Malformed(format!("ice candidate: {err}")))?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(error = %err, "peer connection close failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_sink() -> TransportEventSink {
        TransportEventSink::new(1, |_, _| {})
    }

    async fn placeholder_transport(factory: &WebRtcTransportFactory) -> Arc<dyn PeerTransport> {
        let transport = factory.create(quiet_sink()).await.unwrap();
        for kind in MediaKind::ALL {
            transport.add_placeholder(kind).await.unwrap();
        }
        transport
    }

    /// Media sections of an SDP, each starting at its `m=` line.
    fn media_sections(sdp: &str) -> Vec<Vec<&str>> {
        let mut sections: Vec<Vec<&str>> = Vec::new();
        for line in sdp.lines() {
            if line.starts_with("m=") {
                sections.push(vec![line]);
            } else if let Some(section) = sections.last_mut() {
                section.push(line);
            }
        }
        sections
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn trackless_offer_sends_and_receives_each_kind() {
        let factory = WebRtcTransportFactory::new(&[]).unwrap();
        let transport = placeholder_transport(&factory).await;

        let offer = transport.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        let sections = media_sections(&offer.sdp);
        let kinds: Vec<&str> = sections
            .iter()
            .map(|section| section[0].split_whitespace().next().unwrap_or_default())
            .collect();
        assert_eq!(kinds, vec!["m=audio", "m=video"]);
        for section in &sections {
            assert!(section.contains(&"a=sendrecv"), "{section:?}");
        }
        transport.close().await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn candidate_json_is_applied_after_answer() {
        let factory = WebRtcTransportFactory::new(&[]).unwrap();
        let offerer = placeholder_transport(&factory).await;
        let answerer = factory.create(quiet_sink()).await.unwrap();

        let offer = offerer.create_offer(false).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let candidate = serde_json::to_string(&RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .unwrap();
        let decoded: RTCIceCandidateInit = serde_json::from_str(&candidate).unwrap();
        assert_eq!(decoded.sdp_mid.as_deref(), Some("0"));
        offerer.add_ice_candidate(&candidate).await.unwrap();

        let err = offerer.add_ice_candidate("not json").await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));

        offerer.close().await;
        offerer.close().await;
        assert!(offerer.is_closed());
        assert!(matches!(
            offerer.add_ice_candidate(&candidate).await,
            Err(TransportError::Closed)
        ));
        answerer.close().await;
    }
}
