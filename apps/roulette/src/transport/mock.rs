//! Recording transport used by tests and offline runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    MediaKind, PeerTransport, SessionDescription, TransportError, TransportEvent,
    TransportEventSink, TransportFactory,
};
use crate::media::LocalTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transceiver {
    pub kind: MediaKind,
    /// `None` for placeholders.
    pub track_id: Option<String>,
}

#[derive(Debug, Default)]
struct Recorded {
    transceivers: Vec<Transceiver>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<String>,
    rejected: Vec<String>,
    offers: Vec<bool>,
    answers: usize,
}

/// Stand-in peer connection that records every call.
///
/// Mirrors the ordering rule of a real connection: candidates added before a
/// remote description exists are refused.
pub struct MockTransport {
    id: u64,
    sink: TransportEventSink,
    latency: Option<Duration>,
    closed: AtomicBool,
    close_calls: AtomicU64,
    bad_candidates: Arc<Mutex<HashSet<String>>>,
    recorded: Mutex<Recorded>,
}

impl MockTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Fires a callback as if the underlying connection raised it.
    pub fn emit(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    pub fn transceivers(&self) -> Vec<Transceiver> {
        self.recorded.lock().transceivers.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.recorded.lock().applied.clone()
    }

    /// Candidates that reached the transport too early or were malformed.
    pub fn rejected_candidates(&self) -> Vec<String> {
        self.recorded.lock().rejected.clone()
    }

    /// `ice_restart` flag of every offer created, in order.
    pub fn offers(&self) -> Vec<bool> {
        self.recorded.lock().offers.clone()
    }

    pub fn answers(&self) -> usize {
        self.recorded.lock().answers
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    async fn step(&self) -> Result<(), TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn fake_sdp(&self, origin: &str) -> String {
        let recorded = self.recorded.lock();
        let mut sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns={origin}\r\nt=0 0\r\n", self.id);
        for (mid, transceiver) in recorded.transceivers.iter().enumerate() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na=sendrecv\r\n",
                transceiver.kind
            ));
        }
        sdp
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.step().await?;
        self.recorded.lock().transceivers.push(Transceiver {
            kind: track.kind,
            track_id: Some(track.id.clone()),
        });
        Ok(())
    }

    async fn add_placeholder(&self, kind: MediaKind) -> Result<(), TransportError> {
        self.step().await?;
        self.recorded.lock().transceivers.push(Transceiver {
            kind,
            track_id: None,
        });
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.step().await?;
        let sdp = self.fake_sdp("offer");
        self.recorded.lock().offers.push(ice_restart);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.step().await?;
        if self.recorded.lock().remote.is_none() {
            return Err(TransportError::Setup("answer without remote offer".into()));
        }
        let sdp = self.fake_sdp("answer");
        self.recorded.lock().answers += 1;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.step().await?;
        self.recorded.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.step().await?;
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::Malformed("sdp must start with v=0".into()));
        }
        self.recorded.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        self.step().await?;
        let mut recorded = self.recorded.lock();
        if recorded.remote.is_none() {
            recorded.rejected.push(candidate.to_string());
            return Err(TransportError::Setup("remote description not set".into()));
        }
        if self.bad_candidates.lock().contains(candidate) {
            recorded.rejected.push(candidate.to_string());
            return Err(TransportError::Malformed(format!("bad candidate {candidate}")));
        }
        recorded.applied.push(candidate.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out [`MockTransport`]s and keeps every one it created.
#[derive(Default)]
pub struct MockTransportFactory {
    next_id: AtomicU64,
    latency: Option<Duration>,
    bad_candidates: Arc<Mutex<HashSet<String>>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every transport operation sleeps for `latency` before completing.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    /// Makes every transport refuse `candidate` as malformed.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        self.bad_candidates.lock().insert(candidate.into());
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        sink: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(MockTransport {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            sink,
            latency: self.latency,
            closed: AtomicBool::new(false),
            close_calls: AtomicU64::new(0),
            bad_candidates: Arc::clone(&self.bad_candidates),
            recorded: Mutex::new(Recorded::default()),
        });
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn PeerTransport>)
    }
}
