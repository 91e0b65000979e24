//! Peer media transport seam. The negotiation layer only talks to
//! [`PeerTransport`]; the WebRTC implementation and the recording mock both
//! sit behind it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::media::LocalTrack;

pub mod mock;
pub mod rtc;

pub use rtc::{IceServerConfig, WebRtcTransport, WebRtcTransportFactory};
pub use mock::{MockTransport, MockTransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Serialized candidate ready to be sent to the partner.
    LocalCandidate(String),
    IceState(IceConnectivity),
    PeerState(PeerConnectivity),
    RemoteTrack {
        kind: MediaKind,
        track_id: String,
        stream_id: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),
}

type EmitFn = dyn Fn(u64, TransportEvent) + Send + Sync;

/// Callback target for a transport. Every event is tagged with the session
/// generation the transport was created for, so the owner can drop callbacks
/// that outlive their session.
#[derive(Clone)]
pub struct TransportEventSink {
    generation: u64,
    emit: Arc<EmitFn>,
}

impl TransportEventSink {
    pub fn new<F>(generation: u64, emit: F) -> Self
    where
        F: Fn(u64, TransportEvent) + Send + Sync + 'static,
    {
        Self {
            generation,
            emit: Arc::new(emit),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(self.generation, event);
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Handle to one peer connection, owned by a single match session.
///
/// Every operation on a closed handle returns [`TransportError::Closed`];
/// `close` itself is idempotent.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), TransportError>;
    /// Adds a track-less `sendrecv` transceiver so the offer carries an m-line
    /// for `kind` even without local capture.
    async fn add_placeholder(&self, kind: MediaKind) -> Result<(), TransportError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
