//! Offer/answer state machine for a single pairing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::chat::ChatLog;
use crate::game::GameTable;
use crate::identity::PeerId;
use crate::media::LocalTrack;
use crate::protocol::{MatchAssignment, Signal};
use crate::transport::{
    MediaKind, PeerTransport, SessionDescription, TransportError, TransportEventSink,
    TransportFactory,
};

mod ice_queue;

pub use ice_queue::{CandidateDisposition, FlushReport, IceCandidateQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    OfferPending,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Created => "created",
            NegotiationState::OfferPending => "offer-pending",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session closed")]
    Closed,
    #[error("{kind} not expected in state {state}")]
    Unexpected {
        kind: &'static str,
        state: NegotiationState,
    },
    #[error("stale offer seq {seq} (last applied {last})")]
    StaleOffer { seq: u64, last: u64 },
    #[error("answer seq {seq} does not match offer seq {expected}")]
    StaleAnswer { seq: u64, expected: u64 },
}

/// Outbound half of the relay as seen by a session.
pub trait SignalSink {
    /// Returns false when the relay dropped the message.
    fn send_signal(&self, target: &PeerId, signal: Signal) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
}

/// One pairing with one partner. Owns the transport handle exclusively; once
/// closed, every handler returns [`NegotiationError::Closed`].
pub struct MatchSession {
    generation: u64,
    partner: PeerId,
    initiator: bool,
    state: NegotiationState,
    transport: Arc<dyn PeerTransport>,
    ice: IceCandidateQueue,
    chat: ChatLog,
    game: GameTable,
    local_kinds: BTreeSet<MediaKind>,
    placeholders_added: bool,
    local_seq: u64,
    remote_seq: u64,
    ice_failures: u32,
    remote_tracks: BTreeMap<MediaKind, RemoteTrack>,
}

impl MatchSession {
    /// Builds the transport for a fresh assignment and attaches local tracks.
    pub async fn open(
        generation: u64,
        local: &PeerId,
        assignment: &MatchAssignment,
        factory: &dyn TransportFactory,
        sink: TransportEventSink,
        tracks: &[LocalTrack],
    ) -> Result<Self, NegotiationError> {
        let transport = factory.create(sink).await?;
        let mut local_kinds = BTreeSet::new();
        for track in tracks {
            match transport.attach_track(track).await {
                Ok(()) => {
                    local_kinds.insert(track.kind);
                }
                Err(TransportError::Closed) => return Err(NegotiationError::Closed),
                Err(err) => {
                    tracing::warn!(kind = %track.kind, error = %err, "failed to attach local track");
                }
            }
        }

        let state = if assignment.initiator {
            NegotiationState::OfferPending
        } else {
            NegotiationState::Created
        };
        tracing::debug!(
            generation,
            partner = %assignment.peer_id,
            initiator = assignment.initiator,
            tracks = local_kinds.len(),
            "match session opened"
        );
        Ok(Self {
            generation,
            game: GameTable::new(local.clone(), assignment.peer_id.clone()),
            partner: assignment.peer_id.clone(),
            initiator: assignment.initiator,
            state,
            transport,
            ice: IceCandidateQueue::new(),
            chat: ChatLog::new(),
            local_kinds,
            placeholders_added: false,
            local_seq: 0,
            remote_seq: 0,
            ice_failures: 0,
            remote_tracks: BTreeMap::new(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn pending_candidates(&self) -> usize {
        self.ice.len()
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn chat_mut(&mut self) -> &mut ChatLog {
        &mut self.chat
    }

    pub fn game(&self) -> &GameTable {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut GameTable {
        &mut self.game
    }

    pub fn remote_tracks(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.remote_tracks.values()
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            tracing::debug!(
                generation = self.generation,
                partner = %self.partner,
                from = %self.state,
                to = %next,
                "negotiation state"
            );
            self.state = next;
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() || self.transport.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    /// Initiator path: builds and sends the first offer, or an ICE-restart
    /// offer once the session is stable.
    pub async fn make_offer<S: SignalSink + ?Sized>(
        &mut self,
        signals: &S,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let allowed = if ice_restart {
            self.state == NegotiationState::Stable
        } else {
            self.state == NegotiationState::OfferPending
        };
        if !allowed {
            return Err(NegotiationError::Unexpected {
                kind: "offer",
                state: self.state,
            });
        }

        if !self.placeholders_added {
            for kind in MediaKind::ALL {
                if !self.local_kinds.contains(&kind) {
                    self.transport.add_placeholder(kind).await?;
                }
            }
            self.placeholders_added = true;
        }

        let offer = self.transport.create_offer(ice_restart).await?;
        self.ensure_open()?;
        self.transport.set_local_description(offer.clone()).await?;
        self.ensure_open()?;

        self.local_seq += 1;
        signals.send_signal(
            &self.partner,
            Signal::Offer {
                sdp: offer.sdp,
                seq: Some(self.local_seq),
            },
        );
        self.transition(NegotiationState::OfferSent);
        Ok(())
    }

    /// Responder path, plus renegotiation offers once stable. The answer goes
    /// back to `from`, the envelope's actual sender.
    pub async fn on_offer<S: SignalSink + ?Sized>(
        &mut self,
        signals: &S,
        from: &PeerId,
        sdp: String,
        seq: Option<u64>,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if let Some(seq) = seq {
            if seq <= self.remote_seq {
                return Err(NegotiationError::StaleOffer {
                    seq,
                    last: self.remote_seq,
                });
            }
        }
        if self.initiator && self.state != NegotiationState::Stable {
            return Err(NegotiationError::Unexpected {
                kind: "offer",
                state: self.state,
            });
        }

        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.ensure_open()?;
        self.transition(NegotiationState::OfferReceived);
        if let Some(seq) = seq {
            self.remote_seq = seq;
        }
        self.ice.flush(self.transport.as_ref()).await;
        self.ensure_open()?;

        let answer = self.transport.create_answer().await?;
        self.ensure_open()?;
        self.transport.set_local_description(answer.clone()).await?;
        self.ensure_open()?;

        signals.send_signal(
            from,
            Signal::Answer {
                sdp: answer.sdp,
                seq,
            },
        );
        self.transition(NegotiationState::AnswerSent);
        self.transition(NegotiationState::Stable);
        Ok(())
    }

    pub async fn on_answer(&mut self, sdp: String, seq: Option<u64>) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.state != NegotiationState::OfferSent {
            return Err(NegotiationError::Unexpected {
                kind: "answer",
                state: self.state,
            });
        }
        if let Some(seq) = seq {
            if seq != self.local_seq {
                return Err(NegotiationError::StaleAnswer {
                    seq,
                    expected: self.local_seq,
                });
            }
        }

        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.ensure_open()?;
        self.transition(NegotiationState::AnswerReceived);
        self.ice.flush(self.transport.as_ref()).await;
        self.ensure_open()?;
        self.transition(NegotiationState::Stable);
        Ok(())
    }

    pub async fn on_remote_candidate(
        &mut self,
        candidate: String,
    ) -> Result<CandidateDisposition, NegotiationError> {
        self.ensure_open()?;
        Ok(self
            .ice
            .enqueue_or_apply(self.transport.as_ref(), candidate)
            .await)
    }

    pub fn on_local_candidate<S: SignalSink + ?Sized>(&self, signals: &S, candidate: String) {
        if self.ensure_open().is_err() {
            return;
        }
        signals.send_signal(&self.partner, Signal::Ice { candidate });
    }

    /// Counts an ICE connectivity failure and returns the running total.
    pub fn note_ice_failure(&mut self) -> u32 {
        self.ice_failures += 1;
        self.ice_failures
    }

    pub fn record_remote_track(&mut self, track: RemoteTrack) -> bool {
        if self.is_closed() {
            return false;
        }
        self.remote_tracks.insert(track.kind, track);
        true
    }

    /// Terminal. Safe to call repeatedly; only the first call touches the
    /// transport.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.transition(NegotiationState::Closed);
        self.ice.clear();
        self.chat.clear();
        self.game.reset();
        self.remote_tracks.clear();
        self.transport.close().await;
    }
}
