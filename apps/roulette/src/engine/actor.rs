use std::sync::Arc;
use std::time::Duration;

use knockout_proto::GameEvent;
use relay_bus::{ConnectionEvent, Relay, RelayFrame};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    Command, EngineHandle, EngineNotification, EngineOptions, LeaveReason, NOTIFICATION_CAPACITY,
    SessionSnapshot, SessionStatus,
};
use crate::game::{GameError, GameTable, GameUpdate};
use crate::identity::{LocalIdentity, PeerId};
use crate::media::{LocalTrack, MediaProvider, acquire_local_media};
use crate::negotiation::{
    MatchSession, NegotiationError, NegotiationState, RemoteTrack, SignalSink,
};
use crate::protocol::{self, Channel, ChatInbound, MatchAssignment, Signal, SignalEnvelope};
use crate::relay::RelaySession;
use crate::skip_guard::SkipGuard;
use crate::transport::{
    IceConnectivity, PeerConnectivity, TransportEvent, TransportEventSink, TransportFactory,
};

pub(crate) enum EngineEvent {
    Connection(ConnectionEvent),
    Frame { channel: Channel, frame: RelayFrame },
    Transport { generation: u64, event: TransportEvent },
    OfferDue { generation: u64 },
    RestartDue { generation: u64 },
    Command(Command),
}

/// Actor state. Only the engine task touches it; every input arrives as an
/// [`EngineEvent`].
pub struct PairingEngine {
    identity: PeerId,
    relay: RelaySession,
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaProvider>,
    options: EngineOptions,
    local_tracks: Vec<LocalTrack>,
    session: Option<MatchSession>,
    /// Bumped on every assignment; transport callbacks carry it.
    generation: u64,
    searching: bool,
    relay_ready: bool,
    chat_open: bool,
    partner_connected: bool,
    skip_guard: SkipGuard,
    offer_timer: Option<JoinHandle<()>>,
    /// Deadline for a restarted ICE session to reconnect.
    restart_timer: Option<JoinHandle<()>>,
    status: watch::Sender<SessionStatus>,
    notifications: broadcast::Sender<EngineNotification>,
    events: mpsc::WeakUnboundedSender<EngineEvent>,
}

impl PairingEngine {
    /// Starts the engine task and connects the relay. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        identity: LocalIdentity,
        relay: Arc<dyn Relay>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaProvider>,
        options: EngineOptions,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SessionStatus::Connecting);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let connection_events = relay.connection_events();

        let handle = EngineHandle {
            identity: identity.id().clone(),
            commands: tx.clone(),
            status: status_rx,
            notifications: notifications.clone(),
        };
        let engine = Self {
            identity: identity.id().clone(),
            relay: RelaySession::new(
                relay,
                identity,
                options.destinations.clone(),
                options.cohort.clone(),
            ),
            transports,
            media,
            skip_guard: SkipGuard::new(options.skip_limit),
            options,
            local_tracks: Vec::new(),
            session: None,
            generation: 0,
            searching: false,
            relay_ready: false,
            chat_open: false,
            partner_connected: false,
            offer_timer: None,
            restart_timer: None,
            status,
            notifications,
            events: tx.downgrade(),
        };
        tokio::spawn(engine.run(rx, connection_events));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<EngineEvent>,
        connection_events: broadcast::Receiver<ConnectionEvent>,
    ) {
        self.local_tracks = acquire_local_media(self.media.as_ref(), &self.options.media).await;
        let forwarder = forward_connection_events(connection_events, self.events.clone());

        let connected = self.relay.relay().connect().await;
        match connected {
            // Already-connected relays never emit a fresh Connected event.
            Ok(()) if self.relay.is_connected() => self.on_connected(),
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, "relay connect failed; waiting for reconnect");
                self.set_status(SessionStatus::Reconnecting);
            }
        }

        let mut stopped = false;
        while let Some(event) = rx.recv().await {
            if !self.handle(event).await {
                stopped = true;
                break;
            }
        }
        forwarder.abort();
        if !stopped {
            tracing::debug!("all engine handles dropped");
            self.shutdown().await;
        }
    }

    async fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Connection(ConnectionEvent::Connected) => self.on_connected(),
            EngineEvent::Connection(ConnectionEvent::Disconnected { reason }) => {
                self.on_disconnected(&reason).await
            }
            EngineEvent::Frame { channel, frame } => self.on_frame(channel, frame).await,
            EngineEvent::Transport { generation, event } => {
                self.on_transport(generation, event).await
            }
            EngineEvent::OfferDue { generation } => self.on_offer_due(generation).await,
            EngineEvent::RestartDue { generation } => self.on_restart_due(generation).await,
            EngineEvent::Command(command) => return self.on_command(command).await,
        }
        true
    }

    fn on_connected(&mut self) {
        if self.relay_ready {
            return;
        }
        let events = self.events.clone();
        let subscribed = self.relay.subscribe_all(move |channel, frame| {
            events
                .upgrade()
                .is_some_and(|tx| tx.send(EngineEvent::Frame { channel, frame }).is_ok())
        });
        if let Err(err) = subscribed {
            tracing::warn!(error = %err, "inbox subscription failed");
            self.set_status(SessionStatus::Reconnecting);
            return;
        }
        self.relay_ready = true;
        tracing::info!(identity = %self.identity, "relay connected");
        self.searching = false;
        self.rejoin();
    }

    async fn on_disconnected(&mut self, reason: &str) {
        if self.relay_ready {
            tracing::warn!(reason, "relay connection lost");
        }
        self.relay_ready = false;
        self.searching = false;
        self.relay.stop_pumps();
        self.teardown_session(LeaveReason::RelayLost).await;
        self.set_status(SessionStatus::Reconnecting);
    }

    async fn on_frame(&mut self, channel: Channel, frame: RelayFrame) {
        match channel {
            Channel::Match => match protocol::decode::<MatchAssignment>(&frame) {
                Ok(assignment) => self.on_assignment(assignment).await,
                Err(err) => tracing::debug!(error = %err, "malformed match assignment"),
            },
            Channel::Signal => self.on_signal(&frame).await,
            Channel::Chat => self.on_chat(&frame),
            Channel::Game => self.on_game(&frame),
        }
    }

    async fn on_assignment(&mut self, assignment: MatchAssignment) {
        if assignment.peer_id == self.identity {
            tracing::debug!("assignment to self ignored");
            return;
        }
        if self
            .session
            .as_ref()
            .is_some_and(|session| *session.partner() == assignment.peer_id)
        {
            tracing::debug!(partner = %assignment.peer_id, "duplicate assignment ignored");
            return;
        }

        self.teardown_session(LeaveReason::Superseded).await;
        self.searching = false;
        self.generation += 1;
        let generation = self.generation;
        let sink = self.transport_sink(generation);
        let opened = MatchSession::open(
            generation,
            &self.identity,
            &assignment,
            self.transports.as_ref(),
            sink,
            &self.local_tracks,
        )
        .await;
        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(partner = %assignment.peer_id, error = %err, "failed to open match session");
                self.teardown_and_rejoin(LeaveReason::ConnectionFailed).await;
                return;
            }
        };

        tracing::info!(
            partner = %assignment.peer_id,
            initiator = assignment.initiator,
            generation,
            "matched"
        );
        self.session = Some(session);
        self.partner_connected = false;
        self.notify(EngineNotification::Matched {
            partner: assignment.peer_id,
            initiator: assignment.initiator,
        });
        self.set_status(SessionStatus::ConnectingToPartner);
        if assignment.initiator {
            self.schedule_offer(generation);
        }
    }

    fn schedule_offer(&mut self, generation: u64) {
        let timer = self.schedule(
            self.options.initiator_delay,
            EngineEvent::OfferDue { generation },
        );
        self.offer_timer = Some(timer);
    }

    fn schedule(&self, delay: Duration, event: EngineEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(event);
            }
        })
    }

    async fn on_offer_due(&mut self, generation: u64) {
        if self.current_generation() != Some(generation) {
            tracing::trace!(generation, "stale offer timer");
            return;
        }
        self.offer_timer = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(err) = session.make_offer(&self.relay, false).await {
            log_negotiation_error("offer", &err);
        }
    }

    async fn on_restart_due(&mut self, generation: u64) {
        if self.current_generation() != Some(generation) {
            tracing::trace!(generation, "stale restart deadline");
            return;
        }
        self.restart_timer = None;
        if self.partner_connected {
            return;
        }
        tracing::warn!(generation, "ice restart timed out; dropping partner");
        self.teardown_and_rejoin(LeaveReason::ConnectionFailed).await;
    }

    async fn on_signal(&mut self, frame: &RelayFrame) {
        let decoded =
            protocol::decode::<SignalEnvelope>(frame).and_then(SignalEnvelope::into_signal);
        let (sender, signal) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(error = %err, "malformed signal dropped");
                return;
            }
        };
        let kind = signal.kind();
        let from_partner = self
            .session
            .as_ref()
            .is_some_and(|session| *session.partner() == sender);
        if !from_partner {
            tracing::debug!(kind = kind.as_str(), %sender, "signal outside current match ignored");
            return;
        }
        tracing::trace!(kind = kind.as_str(), %sender, "signal in");

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = match signal {
            Signal::Bye => {
                tracing::info!(partner = %sender, "partner left");
                self.teardown_and_rejoin(LeaveReason::PartnerLeft).await;
                return;
            }
            Signal::Offer { sdp, seq } => session.on_offer(&self.relay, &sender, sdp, seq).await,
            Signal::Answer { sdp, seq } => session.on_answer(sdp, seq).await,
            Signal::Ice { candidate } => session
                .on_remote_candidate(candidate)
                .await
                .map(|disposition| tracing::trace!(?disposition, "remote candidate")),
        };
        let state = session.state();
        if let Err(err) = result {
            log_negotiation_error(kind.as_str(), &err);
        }
        if state == NegotiationState::Stable {
            self.set_status(SessionStatus::Connected);
        }
    }

    async fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        if self.current_generation() != Some(generation) {
            tracing::trace!(generation, ?event, "stale transport event dropped");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(session) = self.session.as_ref() {
                    session.on_local_candidate(&self.relay, candidate);
                }
            }
            TransportEvent::IceState(state) => self.on_ice_state(state).await,
            TransportEvent::PeerState(PeerConnectivity::Closed) => {
                tracing::info!(generation, "peer connection closed");
                self.teardown_and_rejoin(LeaveReason::ConnectionFailed).await;
            }
            TransportEvent::PeerState(state) => {
                tracing::debug!(generation, ?state, "peer connection state");
            }
            TransportEvent::RemoteTrack {
                kind,
                track_id,
                stream_id,
            } => {
                let track = RemoteTrack {
                    kind,
                    track_id,
                    stream_id,
                };
                let recorded = self
                    .session
                    .as_mut()
                    .is_some_and(|session| session.record_remote_track(track.clone()));
                if recorded {
                    tracing::debug!(kind = %track.kind, "remote track attached");
                    self.notify(EngineNotification::RemoteTrack(track));
                }
            }
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectivity) {
        match state {
            IceConnectivity::Connected | IceConnectivity::Completed => {
                if let Some(timer) = self.restart_timer.take() {
                    timer.abort();
                }
                if self.partner_connected {
                    return;
                }
                self.partner_connected = true;
                if let Some(partner) = self.partner() {
                    tracing::info!(%partner, "partner connected");
                    self.notify(EngineNotification::PartnerConnected { partner });
                }
            }
            IceConnectivity::Failed => self.on_ice_failed().await,
            other => tracing::debug!(state = ?other, "ice state"),
        }
    }

    async fn on_ice_failed(&mut self) {
        let budget = self.options.max_ice_restarts;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let failures = session.note_ice_failure();
        if failures > budget {
            tracing::warn!(failures, "ice failed; dropping partner");
            self.teardown_and_rejoin(LeaveReason::ConnectionFailed).await;
            return;
        }
        self.partner_connected = false;
        let generation = session.generation();
        let initiator = session.is_initiator();
        let deadline = self.schedule(
            self.options.ice_restart_timeout,
            EngineEvent::RestartDue { generation },
        );
        if let Some(previous) = self.restart_timer.replace(deadline) {
            previous.abort();
        }
        if !initiator {
            tracing::info!(failures, "ice failed; waiting for restart offer");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        tracing::info!(attempt = failures, "ice failed; restarting");
        if let Err(err) = session.make_offer(&self.relay, true).await {
            log_negotiation_error("ice restart", &err);
        }
    }

    fn on_chat(&mut self, frame: &RelayFrame) {
        let inbound = match protocol::decode::<ChatInbound>(frame) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::debug!(error = %err, "malformed chat dropped");
                return;
            }
        };
        let chat_open = self.chat_open;
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("chat without partner dropped");
            return;
        };
        if inbound
            .sender_id
            .as_ref()
            .is_some_and(|sender| sender != session.partner())
        {
            tracing::debug!(sender = ?inbound.sender_id, "chat from non-partner dropped");
            return;
        }
        let message = session.chat_mut().push_partner(inbound.message, chat_open);
        let unread = session.chat().unread();
        self.notify(EngineNotification::Chat(message));
        if !chat_open {
            self.notify(EngineNotification::UnreadChat { count: unread });
        }
    }

    fn on_game(&mut self, frame: &RelayFrame) {
        let event = match protocol::decode::<GameEvent>(frame) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "malformed game event dropped");
                return;
            }
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(update) = session.game_mut().on_event(event) {
            self.notify(EngineNotification::Game(update));
        }
    }

    /// Returns false once the engine has shut down.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Next => self.on_next().await,
            Command::SendChat(text) => self.send_chat(text),
            Command::SetChatOpen(open) => self.set_chat_open(open),
            Command::InviteGame => {
                let destination = self.options.destinations.game_invite();
                self.game_request(destination, GameTable::invite);
            }
            Command::AcceptGame => {
                let destination = self.options.destinations.game_accept();
                self.game_request(destination, GameTable::accept);
            }
            Command::Shoot { dx, dy } => {
                let destination = self.options.destinations.game_move();
                self.game_request(destination, |game| game.shoot(dx, dy));
            }
            Command::CloseGame => {
                let destination = self.options.destinations.game_close();
                if let Some(request) = self.game_request(destination, GameTable::close) {
                    self.notify(EngineNotification::Game(GameUpdate::Closed {
                        match_id: request.match_id,
                    }));
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn on_next(&mut self) {
        if let Err(retry_in) = self.skip_guard.try_acquire(Instant::now()) {
            tracing::info!(?retry_in, "skip throttled");
            self.notify(EngineNotification::SkipThrottled { retry_in });
            return;
        }
        if let Some(session) = self.session.as_ref() {
            self.relay.send_signal(session.partner(), Signal::Bye);
        }
        self.teardown_and_rejoin(LeaveReason::Skipped).await;
    }

    fn send_chat(&mut self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        if !self.relay_ready {
            tracing::debug!("relay down; chat dropped");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("no partner; chat dropped");
            return;
        };
        let message = session.chat_mut().push_local(text);
        self.relay.send_chat(session.partner(), &message.text);
        self.notify(EngineNotification::Chat(message));
    }

    fn set_chat_open(&mut self, open: bool) {
        self.chat_open = open;
        if !open {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.chat().unread() > 0 {
            session.chat_mut().mark_read();
            self.notify(EngineNotification::UnreadChat { count: 0 });
        }
    }

    fn game_request<T, F>(&mut self, destination: String, build: F) -> Option<T>
    where
        T: Serialize,
        F: FnOnce(&mut GameTable) -> Result<T, GameError>,
    {
        if !self.relay_ready {
            tracing::debug!(%destination, "relay down; game command dropped");
            return None;
        }
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(%destination, "no partner; game command dropped");
            return None;
        };
        match build(session.game_mut()) {
            Ok(request) => {
                self.relay.send_game(destination, &request);
                Some(request)
            }
            Err(err) => {
                tracing::debug!(%destination, error = %err, "game command rejected");
                None
            }
        }
    }

    /// Closes the current session, if any, and announces to matchmaking
    /// again. Repeated calls while already searching publish nothing.
    async fn teardown_and_rejoin(&mut self, reason: LeaveReason) {
        let previous = self.teardown_session(reason).await;
        if !self.relay_ready {
            self.set_status(SessionStatus::Reconnecting);
            return;
        }
        if previous.is_some() || !self.searching {
            self.rejoin();
        }
    }

    async fn teardown_session(&mut self, reason: LeaveReason) -> Option<PeerId> {
        self.cancel_timers();
        let mut session = self.session.take()?;
        let partner = session.partner().clone();
        session.close().await;
        self.partner_connected = false;
        tracing::info!(%partner, generation = session.generation(), %reason, "match ended");
        self.notify(EngineNotification::PartnerLeft {
            partner: partner.clone(),
            reason,
        });
        Some(partner)
    }

    fn rejoin(&mut self) {
        self.searching = self.relay.announce_join();
        if self.searching {
            self.set_status(SessionStatus::Searching);
        } else {
            self.set_status(SessionStatus::Reconnecting);
        }
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.as_ref() {
            self.relay.send_signal(session.partner(), Signal::Bye);
        }
        self.teardown_session(LeaveReason::Shutdown).await;
        self.relay.stop_pumps();
        self.relay_ready = false;
        self.searching = false;
        self.relay.relay().close().await;
        self.set_status(SessionStatus::Offline);
        tracing::info!(identity = %self.identity, "pairing engine stopped");
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            identity: self.identity.clone(),
            status: *self.status.borrow(),
            partner: session.map(|s| s.partner().clone()),
            initiator: session.map(MatchSession::is_initiator),
            negotiation: session.map(MatchSession::state),
            generation: self.generation,
            pending_candidates: session.map_or(0, MatchSession::pending_candidates),
            chat: session
                .map(|s| s.chat().messages().to_vec())
                .unwrap_or_default(),
            unread: session.map_or(0, |s| s.chat().unread()),
            searching: self.searching,
            relay_connected: self.relay_ready,
            game: session.map(|s| s.game().phase().clone()),
            scoreboard: session.and_then(|s| s.game().scoreboard()),
            remote_tracks: session
                .map(|s| s.remote_tracks().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn transport_sink(&self, generation: u64) -> TransportEventSink {
        let events = self.events.clone();
        TransportEventSink::new(generation, move |generation, event| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(EngineEvent::Transport { generation, event });
            }
        })
    }

    fn cancel_timers(&mut self) {
        for timer in [self.offer_timer.take(), self.restart_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(MatchSession::generation)
    }

    fn partner(&self) -> Option<PeerId> {
        self.session.as_ref().map(|s| s.partner().clone())
    }

    fn set_status(&self, next: SessionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(status = %next, "status changed");
            self.notify(EngineNotification::Status(next));
        }
    }

    fn notify(&self, notification: EngineNotification) {
        let _ = self.notifications.send(notification);
    }
}

impl Drop for PairingEngine {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

fn forward_connection_events(
    mut events: broadcast::Receiver<ConnectionEvent>,
    engine: mpsc::WeakUnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "connection events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(tx) = engine.upgrade() else {
                break;
            };
            if tx.send(EngineEvent::Connection(event)).is_err() {
                break;
            }
        }
    })
}

fn log_negotiation_error(step: &'static str, err: &NegotiationError) {
    match err {
        NegotiationError::Transport(_) => {
            tracing::warn!(step, error = %err, "negotiation step failed");
        }
        NegotiationError::Closed
        | NegotiationError::Unexpected { .. }
        | NegotiationError::StaleOffer { .. }
        | NegotiationError::StaleAnswer { .. } => {
            tracing::debug!(step, error = %err, "negotiation step skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NoMedia;
    use crate::protocol::{Destinations, IDENTITY_HEADER};
    use crate::transport::MockTransportFactory;
    use relay_bus::{LocalBus, LocalRelay};

    fn start(bus: &Arc<LocalBus>, id: &str) -> (EngineHandle, Arc<MockTransportFactory>) {
        let factory = MockTransportFactory::new();
        let handle = PairingEngine::spawn(
            LocalIdentity::with_id(id),
            LocalRelay::new(bus.clone()),
            factory.clone(),
            Arc::new(NoMedia),
            EngineOptions {
                initiator_delay: Duration::from_millis(10),
                ..EngineOptions::default()
            },
        );
        (handle, factory)
    }

    fn assign(bus: &LocalBus, to: &str, partner: &str, initiator: bool) {
        let body = serde_json::to_vec(&MatchAssignment {
            peer_id: PeerId::from(partner),
            initiator,
        })
        .unwrap();
        let inbox = Destinations::default().inbox(Channel::Match, &PeerId::from(to));
        bus.publish(RelayFrame::new(inbox, body));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn joins_after_relay_connects() {
        let bus = LocalBus::new();
        let mut joins = bus.subscribe("/app/join");
        let (engine, _) = start(&bus, "a");
        let join = joins.recv().await.unwrap();
        assert_eq!(join.header(IDENTITY_HEADER), Some("a"));
        engine.wait_for_status(SessionStatus::Searching).await.unwrap();
        let snapshot = engine.snapshot().await.unwrap();
        assert!(snapshot.searching);
        assert!(snapshot.relay_connected);
        assert_eq!(snapshot.partner, None);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn assignment_to_self_is_ignored() {
        let bus = LocalBus::new();
        let (engine, factory) = start(&bus, "a");
        engine.wait_for_status(SessionStatus::Searching).await.unwrap();

        assign(&bus, "a", "a", true);
        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.partner, None);
        assert!(factory.created().is_empty());

        assign(&bus, "a", "b", false);
        engine
            .wait_for_status(SessionStatus::ConnectingToPartner)
            .await
            .unwrap();
        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.partner, Some(PeerId::from("b")));
        assert_eq!(snapshot.initiator, Some(false));
        assert_eq!(snapshot.negotiation, Some(NegotiationState::Created));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn shutdown_reports_offline() {
        let bus = LocalBus::new();
        let (engine, _) = start(&bus, "a");
        engine.wait_for_status(SessionStatus::Searching).await.unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(engine.status(), SessionStatus::Offline);
    }
}
