//! [`Relay`] implementation speaking STOMP over a WebSocket.
//!
//! A single supervisor task owns the socket. It performs the STOMP handshake,
//! pumps frames in both directions, keeps heart-beats flowing and reconnects
//! with backoff when the link drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_bus::{ConnectionEvent, Headers, Relay, RelayError, RelayFrame, RelayResult};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::backoff::{Backoff, BackoffConfig};
use super::stomp::{Command, StompFrame, parse_frames};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOPIC_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 32;
const IDLE_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StompRelayConfig {
    pub url: Url,
    /// Requested heart-beat periods in milliseconds, `(send, expect)`.
    pub heartbeat: (u64, u64),
    pub connect_timeout: Duration,
    pub reconnect: BackoffConfig,
}

impl StompRelayConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heartbeat: (10_000, 10_000),
            connect_timeout: Duration::from_secs(10),
            reconnect: BackoffConfig::default(),
        }
    }
}

#[derive(Default)]
struct LinkState {
    outbound: Option<mpsc::UnboundedSender<StompFrame>>,
    topics: HashMap<String, broadcast::Sender<RelayFrame>>,
}

struct Shared {
    link: Mutex<LinkState>,
    events: broadcast::Sender<ConnectionEvent>,
    next_subscription: AtomicU64,
}

impl Shared {
    fn attach(&self, outbound: mpsc::UnboundedSender<StompFrame>) {
        let mut link = self.link.lock();
        link.outbound = Some(outbound);
        link.topics.clear();
        drop(link);
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    /// Drops the outbound queue and every subscription of the lost link.
    fn detach(&self, reason: String) {
        let mut link = self.link.lock();
        let was_connected = link.outbound.take().is_some();
        link.topics.clear();
        drop(link);
        if was_connected {
            let _ = self.events.send(ConnectionEvent::Disconnected { reason });
        }
    }

    fn dispatch(&self, frame: StompFrame) {
        let Some(destination) = frame.get("destination").map(str::to_owned) else {
            tracing::debug!("relay message without destination");
            return;
        };
        let sender = self.link.lock().topics.get(&destination).cloned();
        let Some(sender) = sender else {
            tracing::trace!(%destination, "no local subscriber for relay message");
            return;
        };
        let mut headers = Headers::new();
        for (key, value) in frame.headers {
            if key == "destination" || key == "content-length" {
                continue;
            }
            headers.entry(key).or_insert(value);
        }
        let _ = sender.send(RelayFrame {
            destination,
            headers,
            body: frame.body,
        });
    }
}

pub struct StompRelay {
    config: StompRelayConfig,
    shared: Arc<Shared>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StompRelay {
    pub fn new(config: StompRelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            shared: Arc::new(Shared {
                link: Mutex::new(LinkState::default()),
                events: broadcast::channel(EVENT_CAPACITY).0,
                next_subscription: AtomicU64::new(0),
            }),
            closed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            supervisor: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Relay for StompRelay {
    /// Starts the supervisor and reports the outcome of its first attempt.
    /// Later attempts happen in the background.
    async fn connect(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let first = {
            let mut guard = self.supervisor.lock();
            if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                *guard = Some(tokio::spawn(supervise(
                    self.config.clone(),
                    Arc::clone(&self.shared),
                    self.shutdown.subscribe(),
                    tx,
                )));
                Some(rx)
            }
        };
        match first {
            Some(rx) => rx.await.unwrap_or(Err(RelayError::Closed)),
            None => Ok(()),
        }
    }

    fn subscribe(&self, destination: &str) -> RelayResult<broadcast::Receiver<RelayFrame>> {
        let mut link = self.shared.link.lock();
        let Some(outbound) = link.outbound.clone() else {
            return Err(RelayError::NotConnected);
        };
        if let Some(sender) = link.topics.get(destination) {
            return Ok(sender.subscribe());
        }
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        outbound
            .send(StompFrame::subscribe(&format!("sub-{id}"), destination))
            .map_err(|_| RelayError::NotConnected)?;
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
        link.topics.insert(destination.to_string(), tx);
        tracing::debug!(%destination, "subscribed");
        Ok(rx)
    }

    fn publish(&self, frame: RelayFrame) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let outbound = self
            .shared
            .link
            .lock()
            .outbound
            .clone()
            .ok_or(RelayError::NotConnected)?;
        let mut stomp = StompFrame::send(&frame.destination, frame.body);
        for (key, value) in frame.headers {
            if key != "destination" && key != "content-length" {
                stomp = stomp.header(key, value);
            }
        }
        outbound.send(stomp).map_err(|_| RelayError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.shared.link.lock().outbound.is_some()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::debug!(error = %err, "relay supervisor ended abnormally");
            }
        }
        self.shared.detach("closed".into());
    }
}

impl Drop for StompRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

async fn supervise(
    config: StompRelayConfig,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    first: oneshot::Sender<RelayResult<()>>,
) {
    let mut backoff = Backoff::new(config.reconnect.clone());
    let mut first = Some(first);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match establish(&config).await {
            Ok((ws, heartbeat)) => {
                backoff.reset();
                let (tx, rx) = mpsc::unbounded_channel();
                shared.attach(tx);
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }
                tracing::info!(url = %config.url, ?heartbeat, "relay connected");
                let reason = pump(ws, rx, heartbeat, &shared, &mut shutdown).await;
                tracing::info!(%reason, "relay link lost");
                shared.detach(reason);
            }
            Err(err) => {
                tracing::warn!(url = %config.url, error = %err, "relay connect failed");
                if let Some(first) = first.take() {
                    let _ = first.send(Err(err));
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(attempts = backoff.attempts(), "relay reconnect budget exhausted");
            break;
        };
        tracing::debug!(?delay, attempt = backoff.attempts(), "relay reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn establish(config: &StompRelayConfig) -> RelayResult<(WsStream, (u64, u64))> {
    let handshake = async {
        let (mut ws, _) = connect_async(config.url.as_str())
            .await
            .map_err(|err| RelayError::Transport(format!("websocket connect failed: {err}")))?;
        let host = config.url.host_str().unwrap_or("/");
        ws.send(to_message(&StompFrame::connect(host, config.heartbeat)))
            .await
            .map_err(|err| RelayError::Transport(err.to_string()))?;

        while let Some(message) = ws.next().await {
            let message = message.map_err(|err| RelayError::Transport(err.to_string()))?;
            let data = match message {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            let frames = parse_frames(&data).map_err(|err| RelayError::Protocol(err.to_string()))?;
            for frame in frames {
                match frame.command {
                    Command::Connected => {
                        let heartbeat = frame.negotiate_heartbeat(config.heartbeat);
                        return Ok((ws, heartbeat));
                    }
                    Command::Error => {
                        return Err(RelayError::Protocol(
                            frame.get("message").unwrap_or("rejected").to_string(),
                        ));
                    }
                    other => tracing::debug!(command = %other, "ignoring frame before CONNECTED"),
                }
            }
        }
        Err(RelayError::Transport("closed during handshake".into()))
    };
    tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| RelayError::Transport("relay handshake timed out".into()))?
}

fn to_message(frame: &StompFrame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

/// Runs one connected link until it fails or shutdown is requested and
/// returns the reason it ended.
async fn pump(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<StompFrame>,
    heartbeat: (u64, u64),
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let (mut write, mut read) = ws.split();
    let (send_every, expect_every) = heartbeat;
    let period = [send_every, expect_every]
        .into_iter()
        .filter(|ms| *ms > 0)
        .min()
        .map_or(IDLE_TICK, Duration::from_millis);
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut last_inbound = Instant::now();
    let mut last_outbound = Instant::now();

    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return "outbound queue closed".into();
                };
                tracing::trace!(command = %frame.command, destination = frame.get("destination"), "relay out");
                if let Err(err) = write.send(to_message(&frame)).await {
                    return format!("write failed: {err}");
                }
                last_outbound = Instant::now();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(to_message(&StompFrame::disconnect())).await;
                    let _ = write.close().await;
                    return "closed".into();
                }
            }
            _ = ticker.tick() => {
                if expect_every > 0
                    && last_inbound.elapsed() > Duration::from_millis(expect_every * 2)
                {
                    return "heart-beat timeout".into();
                }
                if send_every > 0
                    && last_outbound.elapsed() >= Duration::from_millis(send_every)
                {
                    if let Err(err) = write.send(Message::Text("\n".into())).await {
                        return format!("heart-beat failed: {err}");
                    }
                    last_outbound = Instant::now();
                }
            }
            message = read.next() => {
                last_inbound = Instant::now();
                let data = match message {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => return "closed by relay".into(),
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                        return "connection closed".into();
                    }
                    Some(Err(err)) => return format!("websocket error: {err}"),
                };
                let frames = match parse_frames(&data) {
                    Ok(frames) => frames,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unparseable relay frame");
                        continue;
                    }
                };
                for frame in frames {
                    match frame.command {
                        Command::Message => shared.dispatch(frame),
                        Command::Error => {
                            let message = frame.get("message").unwrap_or_default().to_string();
                            tracing::warn!(%message, "relay reported error");
                            return format!("relay error: {message}");
                        }
                        Command::Receipt => tracing::trace!(receipt = frame.get("receipt-id"), "relay receipt"),
                        other => tracing::debug!(command = %other, "unexpected relay frame"),
                    }
                }
            }
        }
    }
}
