use std::sync::Arc;
use std::time::Duration;

use relay_bus::{LocalBus, LocalRelay, Relay, RelayFrame};
use roulette_core::engine::{
    EngineHandle, EngineNotification, EngineOptions, LeaveReason, PairingEngine, SessionStatus,
};
use roulette_core::game::GameUpdate;
use roulette_core::media::NoMedia;
use roulette_core::negotiation::NegotiationState;
use roulette_core::protocol::{IDENTITY_HEADER, SignalEnvelope, SignalKind, decode};
use roulette_core::relay::LocalBroker;
use roulette_core::skip_guard::SkipLimit;
use roulette_core::transport::{
    IceConnectivity, MediaKind, MockTransportFactory, PeerConnectivity, TransportEvent,
};
use roulette_core::{LocalIdentity, PeerId};
use serde_json::json;
use tokio::sync::broadcast;

struct Peer {
    engine: EngineHandle,
    relay: Arc<LocalRelay>,
    factory: Arc<MockTransportFactory>,
    notifications: broadcast::Receiver<EngineNotification>,
}

fn options() -> EngineOptions {
    EngineOptions {
        initiator_delay: Duration::from_millis(10),
        ..EngineOptions::default()
    }
}

fn start(bus: &Arc<LocalBus>, id: &str, options: EngineOptions) -> Peer {
    start_with(bus, id, options, MockTransportFactory::new())
}

fn start_with(
    bus: &Arc<LocalBus>,
    id: &str,
    options: EngineOptions,
    factory: Arc<MockTransportFactory>,
) -> Peer {
    let relay = LocalRelay::new(bus.clone());
    let engine = PairingEngine::spawn(
        LocalIdentity::with_id(id),
        relay.clone(),
        factory.clone(),
        Arc::new(NoMedia),
        options,
    );
    let notifications = engine.notifications();
    Peer {
        engine,
        relay,
        factory,
        notifications,
    }
}

/// Lets every in-flight task run to idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn publish(bus: &LocalBus, destination: String, body: serde_json::Value) {
    bus.publish(RelayFrame::new(destination, body.to_string()));
}

fn assign(bus: &LocalBus, to: &str, partner: &str, initiator: bool) {
    publish(
        bus,
        format!("/topic/match/{to}"),
        json!({ "peerId": partner, "initiator": initiator }),
    );
}

fn signal(bus: &LocalBus, to: &str, body: serde_json::Value) {
    publish(bus, format!("/topic/signal/{to}"), body);
}

fn from(frame: &RelayFrame, id: &str) -> bool {
    frame.header(IDENTITY_HEADER) == Some(id)
}

fn drain(rx: &mut broadcast::Receiver<RelayFrame>) -> Vec<RelayFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

async fn next_signal_from(rx: &mut broadcast::Receiver<RelayFrame>, id: &str) -> SignalEnvelope {
    loop {
        let frame = rx.recv().await.unwrap();
        if from(&frame, id) {
            return decode(&frame).unwrap();
        }
    }
}

async fn wait_for<T>(
    rx: &mut broadcast::Receiver<EngineNotification>,
    mut pick: impl FnMut(EngineNotification) -> Option<T>,
) -> T {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Some(found) = pick(notification) {
                    return found;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
        }
    }
}

/// Drives `a` as initiator against a scripted partner `b` up to Stable.
async fn negotiate_as_initiator(bus: &LocalBus, a: &Peer, signals: &mut broadcast::Receiver<RelayFrame>) {
    assign(bus, "a", "b", true);
    let offer = next_signal_from(signals, "a").await;
    assert_eq!(offer.kind, SignalKind::Offer);
    signal(
        bus,
        "a",
        json!({ "type": "ANSWER", "senderId": "b", "sdp": "v=0\r\ns=answer\r\n", "seq": offer.seq }),
    );
    a.engine.wait_for_status(SessionStatus::Connected).await.unwrap();
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn candidates_before_answer_are_applied_in_order() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    assign(&bus, "a", "b", true);
    let offer = next_signal_from(&mut signals, "a").await;
    assert_eq!(offer.kind, SignalKind::Offer);
    assert_eq!(offer.target_peer_id, Some(PeerId::from("b")));
    assert_eq!(offer.seq, Some(1));

    let candidates: Vec<String> = (1..=3)
        .map(|n| format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"))
        .collect();
    for candidate in &candidates {
        signal(&bus, "a", json!({ "type": "ICE", "senderId": "b", "candidate": candidate }));
    }
    settle().await;
    let transport = a.factory.last().unwrap();
    assert!(transport.applied_candidates().is_empty());
    assert_eq!(a.engine.snapshot().await.unwrap().pending_candidates, 3);

    signal(
        &bus,
        "a",
        json!({ "type": "ANSWER", "senderId": "b", "sdp": "v=0\r\ns=answer\r\n", "seq": 1 }),
    );
    a.engine.wait_for_status(SessionStatus::Connected).await.unwrap();

    assert_eq!(transport.applied_candidates(), candidates);
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.negotiation, Some(NegotiationState::Stable));
    assert_eq!(snapshot.pending_candidates, 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn next_sends_one_bye_and_one_join() {
    let bus = LocalBus::new();
    let mut joins = bus.subscribe("/app/join");
    let mut signals = bus.subscribe("/app/signal");
    let a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    negotiate_as_initiator(&bus, &a, &mut signals).await;
    assert_eq!(
        a.engine.snapshot().await.unwrap().negotiation,
        Some(NegotiationState::Stable)
    );

    a.engine.next().unwrap();
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    // The old partner's own BYE arrives after the skip.
    signal(&bus, "a", json!({ "type": "BYE", "senderId": "b" }));
    settle().await;

    let byes: Vec<SignalEnvelope> = drain(&mut signals)
        .iter()
        .filter(|frame| from(frame, "a"))
        .map(|frame| decode::<SignalEnvelope>(frame).unwrap())
        .filter(|envelope| envelope.kind == SignalKind::Bye)
        .collect();
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].target_peer_id, Some(PeerId::from("b")));

    let joined = drain(&mut joins).iter().filter(|frame| from(frame, "a")).count();
    assert_eq!(joined, 2);

    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.partner, None);
    assert!(snapshot.searching);
    assert_eq!(a.factory.last().unwrap().close_calls(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn duplicate_assignment_keeps_session() {
    let bus = LocalBus::new();
    let a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    assign(&bus, "a", "b", false);
    assign(&bus, "a", "b", false);
    settle().await;

    assert_eq!(a.factory.created().len(), 1);
    assert_eq!(a.factory.last().unwrap().close_calls(), 0);
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.generation, 1);
    assert_eq!(snapshot.partner, Some(PeerId::from("b")));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn new_assignment_supersedes_and_mutes_old_transport() {
    let bus = LocalBus::new();
    let mut a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    assign(&bus, "a", "b", false);
    settle().await;
    let old = a.factory.last().unwrap();

    assign(&bus, "a", "c", false);
    let (partner, reason) = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::PartnerLeft { partner, reason } => Some((partner, reason)),
        _ => None,
    })
    .await;
    assert_eq!(partner, PeerId::from("b"));
    assert_eq!(reason, LeaveReason::Superseded);
    settle().await;
    assert_eq!(old.close_calls(), 1);

    old.emit(TransportEvent::PeerState(PeerConnectivity::Closed));
    old.emit(TransportEvent::LocalCandidate("candidate:stale".into()));
    settle().await;
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.partner, Some(PeerId::from("c")));
    assert_eq!(snapshot.generation, 2);
    assert_eq!(a.factory.created().len(), 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn chat_is_scoped_to_partner_and_cleared_on_teardown() {
    let bus = LocalBus::new();
    let mut outbound = bus.subscribe("/app/chat");
    let mut a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    assign(&bus, "a", "b", false);
    settle().await;

    publish(&bus, "/topic/chat/a".into(), json!({ "senderId": "c", "message": "spam" }));
    publish(&bus, "/topic/chat/a".into(), json!({ "senderId": "b", "message": "hi" }));
    let unread = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::UnreadChat { count } => Some(count),
        _ => None,
    })
    .await;
    assert_eq!(unread, 1);
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.chat.len(), 1);
    assert_eq!(snapshot.chat[0].text, "hi");

    a.engine.set_chat_open(true).unwrap();
    a.engine.send_chat("hey").unwrap();
    let sent = outbound.recv().await.unwrap();
    assert!(from(&sent, "a"));
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["targetPeerId"], "b");
    assert_eq!(body["message"], "hey");
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.unread, 0);
    assert_eq!(snapshot.chat.len(), 2);

    signal(&bus, "a", json!({ "type": "BYE", "senderId": "b" }));
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    let snapshot = a.engine.snapshot().await.unwrap();
    assert!(snapshot.chat.is_empty());
    assert_eq!(snapshot.partner, None);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn trackless_offer_carries_both_kinds() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    assign(&bus, "a", "b", true);
    let offer = next_signal_from(&mut signals, "a").await;
    let sdp = offer.sdp.unwrap();
    assert!(sdp.contains("m=audio"));
    assert!(sdp.contains("m=video"));
    assert!(sdp.contains("a=sendrecv"));

    let transceivers = a.factory.last().unwrap().transceivers();
    let kinds: Vec<MediaKind> = transceivers.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    assert!(transceivers.iter().all(|t| t.track_id.is_none()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn ice_failure_restarts_once_then_gives_up() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let mut joins = bus.subscribe("/app/join");
    let mut a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    negotiate_as_initiator(&bus, &a, &mut signals).await;
    let transport = a.factory.last().unwrap();

    transport.emit(TransportEvent::IceState(IceConnectivity::Connected));
    wait_for(&mut a.notifications, |n| {
        matches!(n, EngineNotification::PartnerConnected { .. }).then_some(())
    })
    .await;

    transport.emit(TransportEvent::IceState(IceConnectivity::Failed));
    let restart = next_signal_from(&mut signals, "a").await;
    assert_eq!(restart.kind, SignalKind::Offer);
    assert_eq!(restart.seq, Some(2));
    assert_eq!(transport.offers(), vec![false, true]);

    transport.emit(TransportEvent::IceState(IceConnectivity::Failed));
    let reason = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::PartnerLeft { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, LeaveReason::ConnectionFailed);
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    settle().await;
    assert_eq!(drain(&mut joins).iter().filter(|f| from(f, "a")).count(), 2);
}

fn restart_options() -> EngineOptions {
    EngineOptions {
        ice_restart_timeout: Duration::from_secs(2),
        ..options()
    }
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn initiator_drops_partner_when_restart_goes_unanswered() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let mut joins = bus.subscribe("/app/join");
    let mut a = start(&bus, "a", restart_options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    negotiate_as_initiator(&bus, &a, &mut signals).await;
    let transport = a.factory.last().unwrap();
    transport.emit(TransportEvent::IceState(IceConnectivity::Connected));

    transport.emit(TransportEvent::IceState(IceConnectivity::Failed));
    transport.emit(TransportEvent::PeerState(PeerConnectivity::Failed));
    let restart = next_signal_from(&mut signals, "a").await;
    assert_eq!(restart.kind, SignalKind::Offer);
    assert_eq!(transport.offers(), vec![false, true]);

    let reason = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::PartnerLeft { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, LeaveReason::ConnectionFailed);
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    settle().await;
    assert_eq!(a.engine.snapshot().await.unwrap().partner, None);
    assert_eq!(transport.close_calls(), 1);
    assert_eq!(drain(&mut joins).iter().filter(|f| from(f, "a")).count(), 2);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn responder_drops_partner_when_no_restart_offer_arrives() {
    let bus = LocalBus::new();
    let mut joins = bus.subscribe("/app/join");
    let mut a = start(&bus, "a", restart_options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    assign(&bus, "a", "b", false);
    a.engine
        .wait_for_status(SessionStatus::ConnectingToPartner)
        .await
        .unwrap();
    signal(
        &bus,
        "a",
        json!({ "type": "OFFER", "senderId": "b", "sdp": "v=0\r\ns=offer\r\n", "seq": 1 }),
    );
    a.engine.wait_for_status(SessionStatus::Connected).await.unwrap();
    let transport = a.factory.last().unwrap();
    transport.emit(TransportEvent::IceState(IceConnectivity::Connected));

    transport.emit(TransportEvent::IceState(IceConnectivity::Failed));
    transport.emit(TransportEvent::PeerState(PeerConnectivity::Failed));
    settle().await;
    assert_eq!(
        a.engine.snapshot().await.unwrap().partner,
        Some(PeerId::from("b"))
    );

    let reason = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::PartnerLeft { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, LeaveReason::ConnectionFailed);
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    settle().await;
    assert_eq!(drain(&mut joins).iter().filter(|f| from(f, "a")).count(), 2);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn restart_that_reconnects_keeps_partner() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let a = start(&bus, "a", restart_options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    negotiate_as_initiator(&bus, &a, &mut signals).await;
    let transport = a.factory.last().unwrap();

    transport.emit(TransportEvent::IceState(IceConnectivity::Failed));
    let restart = next_signal_from(&mut signals, "a").await;
    signal(
        &bus,
        "a",
        json!({ "type": "ANSWER", "senderId": "b", "sdp": "v=0\r\ns=answer\r\n", "seq": restart.seq }),
    );
    settle().await;
    transport.emit(TransportEvent::IceState(IceConnectivity::Connected));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.partner, Some(PeerId::from("b")));
    assert_eq!(snapshot.status, SessionStatus::Connected);
    assert_eq!(transport.close_calls(), 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn slow_transport_is_superseded_by_later_assignment() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let a = start_with(
        &bus,
        "a",
        options(),
        MockTransportFactory::with_latency(Duration::from_millis(200)),
    );
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    assign(&bus, "a", "b", true);
    assign(&bus, "a", "c", true);
    let offer = next_signal_from(&mut signals, "a").await;
    assert_eq!(offer.target_peer_id, Some(PeerId::from("c")));

    settle().await;
    let created = a.factory.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].close_calls(), 1);
    assert!(created[0].offers().is_empty());
    let snapshot = a.engine.snapshot().await.unwrap();
    assert_eq!(snapshot.partner, Some(PeerId::from("c")));
    assert_eq!(snapshot.generation, 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn relay_loss_ends_match_and_rejoins_on_reconnect() {
    let bus = LocalBus::new();
    let mut joins = bus.subscribe("/app/join");
    let mut a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    assign(&bus, "a", "b", false);
    a.engine
        .wait_for_status(SessionStatus::ConnectingToPartner)
        .await
        .unwrap();

    a.relay.disconnect("network gone");
    let reason = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::PartnerLeft { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, LeaveReason::RelayLost);
    a.engine
        .wait_for_status(SessionStatus::Reconnecting)
        .await
        .unwrap();
    assert_eq!(a.engine.snapshot().await.unwrap().partner, None);

    a.relay.connect().await.unwrap();
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    assign(&bus, "a", "c", false);
    a.engine
        .wait_for_status(SessionStatus::ConnectingToPartner)
        .await
        .unwrap();
    assert_eq!(
        a.engine.snapshot().await.unwrap().partner,
        Some(PeerId::from("c"))
    );
    settle().await;
    assert_eq!(drain(&mut joins).iter().filter(|f| from(f, "a")).count(), 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn broker_pairs_peers_and_runs_a_game() {
    let bus = LocalBus::new();
    let _broker = LocalBroker::spawn(bus.clone(), Default::default());
    let mut a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    let mut b = start(&bus, "b", options());

    let initiator = wait_for(&mut b.notifications, |n| match n {
        EngineNotification::Matched { partner, initiator } if partner == "a" => Some(initiator),
        _ => None,
    })
    .await;
    assert!(initiator);
    a.engine.wait_for_status(SessionStatus::Connected).await.unwrap();
    b.engine.wait_for_status(SessionStatus::Connected).await.unwrap();
    assert_eq!(b.factory.last().unwrap().offers(), vec![false]);
    assert_eq!(a.factory.last().unwrap().answers(), 1);

    a.engine.invite_game().unwrap();
    wait_for(&mut b.notifications, |n| {
        matches!(n, EngineNotification::Game(GameUpdate::Invited { .. })).then_some(())
    })
    .await;
    b.engine.accept_game().unwrap();
    let a_turn = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::Game(GameUpdate::Started { my_turn, .. }) => Some(my_turn),
        _ => None,
    })
    .await;
    let b_turn = wait_for(&mut b.notifications, |n| match n {
        EngineNotification::Game(GameUpdate::Started { my_turn, .. }) => Some(my_turn),
        _ => None,
    })
    .await;
    assert!(a_turn);
    assert!(!b_turn);

    // Out of turn: dropped locally.
    b.engine.shoot(0.1, 0.0).unwrap();
    a.engine.shoot(0.1, 0.0).unwrap();
    let (by, my_turn) = wait_for(&mut b.notifications, |n| match n {
        EngineNotification::Game(GameUpdate::Moved { by, my_turn }) => Some((by, my_turn)),
        _ => None,
    })
    .await;
    assert_eq!(by, PeerId::from("a"));
    assert!(my_turn);
    settle().await;
    let board = a.engine.snapshot().await.unwrap().scoreboard.unwrap();
    assert_eq!(board.round, 1);
    assert!(!board.my_turn);

    a.engine.close_game().unwrap();
    wait_for(&mut b.notifications, |n| {
        matches!(n, EngineNotification::Game(GameUpdate::Closed { .. })).then_some(())
    })
    .await;
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn rapid_skips_are_throttled() {
    let bus = LocalBus::new();
    let mut a = start(
        &bus,
        "a",
        EngineOptions {
            skip_limit: SkipLimit {
                max_attempts: 2,
                window: Duration::from_secs(5),
                cooldown: Duration::from_secs(5),
            },
            ..options()
        },
    );
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();

    for _ in 0..3 {
        a.engine.next().unwrap();
    }
    let retry_in = wait_for(&mut a.notifications, |n| match n {
        EngineNotification::SkipThrottled { retry_in } => Some(retry_in),
        _ => None,
    })
    .await;
    assert_eq!(retry_in, Duration::from_secs(5));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn shutdown_says_bye() {
    let bus = LocalBus::new();
    let mut signals = bus.subscribe("/app/signal");
    let a = start(&bus, "a", options());
    a.engine.wait_for_status(SessionStatus::Searching).await.unwrap();
    assign(&bus, "a", "b", false);
    a.engine
        .wait_for_status(SessionStatus::ConnectingToPartner)
        .await
        .unwrap();

    a.engine.shutdown().await.unwrap();
    let bye = next_signal_from(&mut signals, "a").await;
    assert_eq!(bye.kind, SignalKind::Bye);
    assert_eq!(a.engine.status(), SessionStatus::Offline);
    assert!(!a.relay.is_connected());
}
