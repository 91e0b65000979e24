use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TOPIC_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 32;

pub type Headers = BTreeMap<String, String>;

/// One message carried by a relay: destination, string headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub destination: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RelayFrame {
    pub fn new(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body_str(&self) -> RelayResult<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|err| RelayError::Protocol(format!("frame body is not utf-8: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay closed")]
    Closed,
    #[error("relay not connected")]
    NotConnected,
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Publish/subscribe connection to a message relay.
///
/// Subscriptions belong to the connection that created them: when the relay
/// drops, every receiver handed out by [`Relay::subscribe`] is closed and the
/// caller must subscribe again after [`ConnectionEvent::Connected`].
#[async_trait]
pub trait Relay: Send + Sync {
    async fn connect(&self) -> RelayResult<()>;
    fn subscribe(&self, destination: &str) -> RelayResult<broadcast::Receiver<RelayFrame>>;
    fn publish(&self, frame: RelayFrame) -> RelayResult<()>;
    fn is_connected(&self) -> bool;
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
    async fn close(&self);
}

/// In-memory topic fan-out shared by any number of [`LocalRelay`] clients.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<RelayFrame>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender_for(&self, destination: &str) -> broadcast::Sender<RelayFrame> {
        if let Some(sender) = self.topics.read().get(destination) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(destination.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, destination: &str) -> broadcast::Receiver<RelayFrame> {
        self.sender_for(destination).subscribe()
    }

    /// Delivers to current subscribers; a frame with no listener is dropped.
    pub fn publish(&self, frame: RelayFrame) -> usize {
        let sender = self.sender_for(&frame.destination);
        sender.send(frame).unwrap_or(0)
    }
}

/// A single client's view of a [`LocalBus`] with an explicit connection flag.
pub struct LocalRelay {
    bus: Arc<LocalBus>,
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    bridges: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalRelay {
    pub fn new(bus: Arc<LocalBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CAPACITY).0,
            bridges: Mutex::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    /// Simulates losing the relay: subscriptions end and publishes fail until
    /// [`Relay::connect`] is called again.
    pub fn disconnect(&self, reason: impl Into<String>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.bridges.lock().drain(..) {
            handle.abort();
        }
        let reason = reason.into();
        tracing::debug!(%reason, "local relay disconnected");
        let _ = self.events.send(ConnectionEvent::Disconnected { reason });
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn connect(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Connected);
        }
        Ok(())
    }

    fn subscribe(&self, destination: &str) -> RelayResult<broadcast::Receiver<RelayFrame>> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let mut upstream = self.bus.subscribe(destination);
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "local relay subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let mut bridges = self.bridges.lock();
        bridges.retain(|handle| !handle.is_finished());
        bridges.push(handle);
        Ok(rx)
    }

    fn publish(&self, frame: RelayFrame) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.bus.publish(frame);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.disconnect("closed");
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        for handle in self.bridges.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("/topic/match/a");
        let delivered = bus.publish(
            RelayFrame::new("/topic/match/a", Bytes::from_static(b"ping")).with_header("uuid", "b"),
        );
        assert_eq!(delivered, 1);
        let frame = sub.recv().await.expect("receive ok");
        assert_eq!(frame.destination, "/topic/match/a");
        assert_eq!(frame.header("uuid"), Some("b"));
        assert_eq!(frame.body_str().unwrap(), "ping");
    }

    #[tokio::test]
    async fn publish_without_listener_is_dropped() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish(RelayFrame::new("/app/join", "x")), 0);
    }

    #[tokio::test]
    async fn relay_requires_connection() {
        let relay = LocalRelay::new(LocalBus::new());
        assert!(matches!(
            relay.publish(RelayFrame::new("/app/join", "x")),
            Err(RelayError::NotConnected)
        ));
        assert!(matches!(
            relay.subscribe("/topic/match/a"),
            Err(RelayError::NotConnected)
        ));
        relay.connect().await.unwrap();
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn disconnect_ends_subscriptions() {
        let bus = LocalBus::new();
        let relay = LocalRelay::new(bus.clone());
        let mut events = relay.connection_events();
        relay.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);

        let mut sub = relay.subscribe("/topic/chat/a").unwrap();
        bus.publish(RelayFrame::new("/topic/chat/a", "hello"));
        let frame = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.body_str().unwrap(), "hello");

        relay.disconnect("broker restart");
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected {
                reason: "broker restart".into()
            }
        );
        let ended = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert!(matches!(ended, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let relay = LocalRelay::new(LocalBus::new());
        relay.connect().await.unwrap();
        relay.close().await;
        assert!(!relay.is_connected());
        assert!(matches!(relay.connect().await, Err(RelayError::Closed)));
        assert!(matches!(
            relay.publish(RelayFrame::new("/app/join", "x")),
            Err(RelayError::Closed)
        ));
    }
}
