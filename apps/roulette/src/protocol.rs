//! Wire contract between the client and the relay.
//!
//! Every publish carries the sender's identity in the `uuid` header; the relay
//! stamps it back onto forwarded payloads as `senderId`.

use relay_bus::RelayFrame;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::identity::PeerId;

pub const IDENTITY_HEADER: &str = "uuid";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} envelope missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Logical inbound channel a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Match,
    Signal,
    Chat,
    Game,
}

impl Channel {
    /// Subscription order: match and signal must be live before `join` goes out.
    pub const ALL: [Channel; 4] = [Channel::Match, Channel::Signal, Channel::Chat, Channel::Game];

    fn segment(self) -> &'static str {
        match self {
            Channel::Match => "match",
            Channel::Signal => "signal",
            Channel::Chat => "chat",
            Channel::Game => "game",
        }
    }
}

/// Maps logical topics onto relay destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    publish_prefix: String,
    subscribe_prefix: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self::new("/app", "/topic")
    }
}

impl Destinations {
    pub fn new(publish_prefix: impl Into<String>, subscribe_prefix: impl Into<String>) -> Self {
        Self {
            publish_prefix: trim_prefix(publish_prefix.into()),
            subscribe_prefix: trim_prefix(subscribe_prefix.into()),
        }
    }

    pub fn inbox(&self, channel: Channel, id: &PeerId) -> String {
        format!("{}/{}/{}", self.subscribe_prefix, channel.segment(), id)
    }

    pub fn join(&self) -> String {
        self.outbound("join")
    }

    pub fn signal(&self) -> String {
        self.outbound("signal")
    }

    pub fn chat(&self) -> String {
        self.outbound("chat")
    }

    pub fn game_invite(&self) -> String {
        self.outbound("game/invite")
    }

    pub fn game_accept(&self) -> String {
        self.outbound("game/accept")
    }

    pub fn game_move(&self) -> String {
        self.outbound("game/move")
    }

    pub fn game_close(&self) -> String {
        self.outbound("game/close")
    }

    fn outbound(&self, path: &str) -> String {
        format!("{}/{}", self.publish_prefix, path)
    }
}

fn trim_prefix(mut prefix: String) -> String {
    while prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    Bye,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "OFFER",
            SignalKind::Answer => "ANSWER",
            SignalKind::Ice => "ICE",
            SignalKind::Bye => "BYE",
        }
    }
}

/// Serialized signaling unit. Payloads are opaque and only round-tripped to
/// the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opaque_string"
    )]
    pub candidate: Option<String>,
    /// Negotiation sequence number stamped on OFFER and ANSWER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Typed view of a validated envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer { sdp: String, seq: Option<u64> },
    Answer { sdp: String, seq: Option<u64> },
    Ice { candidate: String },
    Bye,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Answer { .. } => SignalKind::Answer,
            Signal::Ice { .. } => SignalKind::Ice,
            Signal::Bye => SignalKind::Bye,
        }
    }
}

impl SignalEnvelope {
    pub fn outbound(target: &PeerId, signal: Signal) -> Self {
        let mut envelope = Self {
            kind: signal.kind(),
            sender_id: None,
            target_peer_id: Some(target.clone()),
            sdp: None,
            candidate: None,
            seq: None,
        };
        match signal {
            Signal::Offer { sdp, seq } | Signal::Answer { sdp, seq } => {
                envelope.sdp = Some(sdp);
                envelope.seq = seq;
            }
            Signal::Ice { candidate } => envelope.candidate = Some(candidate),
            Signal::Bye => {}
        }
        envelope
    }

    /// Validates required fields and returns the sender with the typed signal.
    pub fn into_signal(self) -> Result<(PeerId, Signal), ProtocolError> {
        let kind = self.kind.as_str();
        let sender = self.sender_id.ok_or(ProtocolError::MissingField {
            kind,
            field: "senderId",
        })?;
        let signal = match self.kind {
            SignalKind::Offer => Signal::Offer {
                sdp: self.sdp.ok_or(ProtocolError::MissingField { kind, field: "sdp" })?,
                seq: self.seq,
            },
            SignalKind::Answer => Signal::Answer {
                sdp: self.sdp.ok_or(ProtocolError::MissingField { kind, field: "sdp" })?,
                seq: self.seq,
            },
            SignalKind::Ice => Signal::Ice {
                candidate: self.candidate.ok_or(ProtocolError::MissingField {
                    kind,
                    field: "candidate",
                })?,
            },
            SignalKind::Bye => Signal::Bye,
        };
        Ok((sender, signal))
    }
}

/// Browsers send candidates as objects; keep them as serialized text.
fn opaque_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAssignment {
    pub peer_id: PeerId,
    pub initiator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutbound {
    pub target_peer_id: PeerId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInbound {
    #[serde(default)]
    pub sender_id: Option<PeerId>,
    pub message: String,
}

pub fn decode<T: DeserializeOwned>(frame: &RelayFrame) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(&frame.body)?)
}
