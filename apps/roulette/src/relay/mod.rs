//! Identity-bound view of the relay: inbox subscriptions and typed publishes.

use std::sync::Arc;

use parking_lot::Mutex;
use relay_bus::{Relay, RelayError, RelayFrame};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::identity::{LocalIdentity, PeerId};
use crate::negotiation::SignalSink;
use crate::protocol::{Channel, ChatOutbound, Destinations, IDENTITY_HEADER, Signal, SignalEnvelope};

pub mod backoff;
pub mod broker;
pub mod stomp;
pub mod websocket;

pub use backoff::{Backoff, BackoffConfig};
pub use broker::LocalBroker;
pub use websocket::{StompRelay, StompRelayConfig};

/// Relay handle bound to one local identity.
///
/// Publishing while the relay is down is a logged no-op; every publish
/// reports whether the frame was handed to the relay.
pub struct RelaySession {
    relay: Arc<dyn Relay>,
    identity: LocalIdentity,
    destinations: Destinations,
    cohort: String,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl RelaySession {
    pub fn new(
        relay: Arc<dyn Relay>,
        identity: LocalIdentity,
        destinations: Destinations,
        cohort: impl Into<String>,
    ) -> Self {
        Self {
            relay,
            identity,
            destinations,
            cohort: cohort.into(),
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    pub fn identity(&self) -> &PeerId {
        self.identity.id()
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Subscribes the identity's inboxes in [`Channel::ALL`] order and feeds
    /// every frame to `forward`. Pumps from a previous connection are stopped
    /// first. A pump ends when its subscription closes or `forward` returns
    /// false.
    pub fn subscribe_all<F>(&self, forward: F) -> Result<(), RelayError>
    where
        F: Fn(Channel, RelayFrame) -> bool + Clone + Send + Sync + 'static,
    {
        self.stop_pumps();
        let mut started: Vec<JoinHandle<()>> = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let destination = self.destinations.inbox(channel, self.identity.id());
            let receiver = match self.relay.subscribe(&destination) {
                Ok(receiver) => receiver,
                Err(err) => {
                    for handle in started {
                        handle.abort();
                    }
                    return Err(err);
                }
            };
            tracing::debug!(%destination, "inbox subscribed");
            started.push(tokio::spawn(pump(channel, receiver, forward.clone())));
        }
        *self.pumps.lock() = started;
        Ok(())
    }

    pub fn stop_pumps(&self) {
        for handle in self.pumps.lock().drain(..) {
            handle.abort();
        }
    }

    fn publish_raw(&self, destination: String, body: Vec<u8>) -> bool {
        let frame = RelayFrame::new(destination, body)
            .with_header(IDENTITY_HEADER, self.identity.id().as_str());
        let destination = frame.destination.clone();
        match self.relay.publish(frame) {
            Ok(()) => true,
            Err(RelayError::NotConnected | RelayError::Closed) => {
                tracing::debug!(%destination, "relay not connected; publish skipped");
                false
            }
            Err(err) => {
                tracing::warn!(%destination, error = %err, "relay publish failed");
                false
            }
        }
    }

    fn publish_json<T: Serialize>(&self, destination: String, payload: &T) -> bool {
        match serde_json::to_vec(payload) {
            Ok(body) => self.publish_raw(destination, body),
            Err(err) => {
                tracing::warn!(%destination, error = %err, "failed to encode payload");
                false
            }
        }
    }

    /// Announces the identity to matchmaking. The body is the cohort tag as
    /// plain text.
    pub fn announce_join(&self) -> bool {
        let sent = self.publish_raw(self.destinations.join(), self.cohort.clone().into_bytes());
        if sent {
            tracing::info!(cohort = %self.cohort, "joined matchmaking");
        }
        sent
    }

    pub fn send_chat(&self, partner: &PeerId, message: &str) -> bool {
        self.publish_json(
            self.destinations.chat(),
            &ChatOutbound {
                target_peer_id: partner.clone(),
                message: message.to_string(),
            },
        )
    }

    pub fn send_game<T: Serialize>(&self, destination: String, request: &T) -> bool {
        self.publish_json(destination, request)
    }
}

impl SignalSink for RelaySession {
    fn send_signal(&self, target: &PeerId, signal: Signal) -> bool {
        let kind = signal.kind();
        let sent = self.publish_json(
            self.destinations.signal(),
            &SignalEnvelope::outbound(target, signal),
        );
        tracing::trace!(kind = kind.as_str(), %target, sent, "signal out");
        sent
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.stop_pumps();
    }
}

async fn pump<F>(channel: Channel, mut receiver: broadcast::Receiver<RelayFrame>, forward: F)
where
    F: Fn(Channel, RelayFrame) -> bool,
{
    loop {
        match receiver.recv().await {
            Ok(frame) => {
                if !forward(channel, frame) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?channel, skipped, "inbox lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!(?channel, "inbox closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use relay_bus::{LocalBus, LocalRelay};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session(bus: &Arc<LocalBus>, id: &str) -> (Arc<LocalRelay>, RelaySession) {
        let relay = LocalRelay::new(bus.clone());
        let session = RelaySession::new(
            relay.clone(),
            LocalIdentity::with_id(id),
            Destinations::default(),
            "default",
        );
        (relay, session)
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn publishes_carry_identity_header() {
        let bus = LocalBus::new();
        let (relay, session) = session(&bus, "a");
        let mut joins = bus.subscribe("/app/join");
        let mut signals = bus.subscribe("/app/signal");

        assert!(!session.announce_join());
        relay.connect().await.unwrap();
        assert!(session.announce_join());
        let join = joins.recv().await.unwrap();
        assert_eq!(join.header(IDENTITY_HEADER), Some("a"));
        assert_eq!(join.body_str().unwrap(), "default");

        assert!(session.send_signal(&PeerId::from("b"), Signal::Bye));
        let frame = signals.recv().await.unwrap();
        let envelope: SignalEnvelope = decode(&frame).unwrap();
        assert_eq!(envelope.target_peer_id, Some(PeerId::from("b")));
        assert_eq!(frame.header(IDENTITY_HEADER), Some("a"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn inbox_frames_reach_forwarder_by_channel() {
        let bus = LocalBus::new();
        let (relay, session) = session(&bus, "a");
        relay.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .subscribe_all(move |channel, frame| tx.send((channel, frame)).is_ok())
            .unwrap();

        bus.publish(RelayFrame::new("/topic/chat/a", "{}"));
        bus.publish(RelayFrame::new("/topic/match/a", "{}"));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut channels = [first.0, second.0].to_vec();
        channels.sort_by_key(|c| Channel::ALL.iter().position(|x| x == c));
        assert_eq!(channels, vec![Channel::Match, Channel::Chat]);

        relay.disconnect("gone");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.publish(RelayFrame::new("/topic/chat/a", "{}")), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn subscribe_all_fails_while_disconnected() {
        let bus = LocalBus::new();
        let (_relay, session) = session(&bus, "a");
        let result = session.subscribe_all(|_, _| true);
        assert!(matches!(result, Err(RelayError::NotConnected)));
        assert!(session.pumps.lock().is_empty());
    }
}
