//! In-process stand-in for the relay server, running on a [`LocalBus`].
//!
//! Handles matchmaking, forwards signaling and chat with the sender stamped
//! from the `uuid` header, and hosts authoritative Knockout matches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use knockout_proto::{
    AcceptRequest, CloseRequest, GameEvent, InviteRequest, KnockoutMatch, MoveRequest, Shot,
    ShotOutcome,
};
use relay_bus::{LocalBus, RelayFrame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::{
    Channel, ChatInbound, ChatOutbound, Destinations, IDENTITY_HEADER, MatchAssignment, decode,
};

const DEFAULT_COHORT: &str = "default";

#[derive(Debug, Clone, Copy)]
enum Route {
    Join,
    Signal,
    Chat,
    Invite,
    Accept,
    Move,
    Close,
}

pub struct LocalBroker {
    tasks: Vec<JoinHandle<()>>,
}

impl LocalBroker {
    /// Subscribes to every publish destination before returning, so frames
    /// published right after `spawn` are not lost.
    pub fn spawn(bus: Arc<LocalBus>, destinations: Destinations) -> Self {
        let routes = [
            (Route::Join, destinations.join()),
            (Route::Signal, destinations.signal()),
            (Route::Chat, destinations.chat()),
            (Route::Invite, destinations.game_invite()),
            (Route::Accept, destinations.game_accept()),
            (Route::Move, destinations.game_move()),
            (Route::Close, destinations.game_close()),
        ];
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(routes.len() + 1);
        for (route, destination) in routes {
            let mut inbound = bus.subscribe(&destination);
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match inbound.recv().await {
                        Ok(frame) => {
                            if tx.send((route, frame)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(?route, skipped, "broker lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        drop(tx);

        let state = BrokerState {
            bus,
            destinations,
            waiting: HashMap::new(),
            invites: HashMap::new(),
            games: HashMap::new(),
        };
        tasks.push(tokio::spawn(state.run(rx)));
        Self { tasks }
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct PendingInvite {
    inviter: PeerId,
    invitee: PeerId,
}

struct BrokerState {
    bus: Arc<LocalBus>,
    destinations: Destinations,
    waiting: HashMap<String, VecDeque<PeerId>>,
    invites: HashMap<String, PendingInvite>,
    games: HashMap<String, KnockoutMatch>,
}

impl BrokerState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<(Route, RelayFrame)>) {
        while let Some((route, frame)) = rx.recv().await {
            let Some(sender) = frame.header(IDENTITY_HEADER).map(PeerId::from) else {
                tracing::debug!(?route, "dropping frame without identity header");
                continue;
            };
            match route {
                Route::Join => self.on_join(sender, &frame),
                Route::Signal => self.on_signal(sender, &frame),
                Route::Chat => self.on_chat(sender, &frame),
                Route::Invite => self.on_invite(sender, &frame),
                Route::Accept => self.on_accept(sender, &frame),
                Route::Move => self.on_move(sender, &frame),
                Route::Close => self.on_close(sender, &frame),
            }
        }
    }

    fn deliver<T: Serialize>(&self, channel: Channel, to: &PeerId, payload: &T) {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                self.bus
                    .publish(RelayFrame::new(self.destinations.inbox(channel, to), body));
            }
            Err(err) => tracing::warn!(error = %err, "broker failed to encode payload"),
        }
    }

    fn parse<T: DeserializeOwned>(frame: &RelayFrame) -> Option<T> {
        match decode(frame) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(destination = %frame.destination, error = %err, "broker dropped malformed frame");
                None
            }
        }
    }

    /// First joiner of a cohort waits; the next one is paired with it and
    /// told to initiate.
    fn on_join(&mut self, sender: PeerId, frame: &RelayFrame) {
        let cohort = frame
            .body_str()
            .ok()
            .map(str::trim)
            .filter(|cohort| !cohort.is_empty())
            .unwrap_or(DEFAULT_COHORT)
            .to_string();
        let queue = self.waiting.entry(cohort.clone()).or_default();
        if queue.contains(&sender) {
            return;
        }
        let Some(partner) = queue.pop_front() else {
            tracing::debug!(peer = %sender, %cohort, "peer waiting for a partner");
            queue.push_back(sender);
            return;
        };
        tracing::info!(waiting = %partner, joiner = %sender, %cohort, "paired");
        self.deliver(
            Channel::Match,
            &partner,
            &MatchAssignment {
                peer_id: sender.clone(),
                initiator: false,
            },
        );
        self.deliver(
            Channel::Match,
            &sender,
            &MatchAssignment {
                peer_id: partner,
                initiator: true,
            },
        );
    }

    fn on_signal(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(mut envelope) = Self::parse::<Value>(frame) else {
            return;
        };
        let Some(object) = envelope.as_object_mut() else {
            return;
        };
        let Some(target) = object
            .get("targetPeerId")
            .and_then(Value::as_str)
            .map(PeerId::from)
        else {
            tracing::debug!(peer = %sender, "signal without target");
            return;
        };
        object.insert("senderId".into(), Value::String(sender.to_string()));
        self.deliver(Channel::Signal, &target, &envelope);
    }

    fn on_chat(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(chat) = Self::parse::<ChatOutbound>(frame) else {
            return;
        };
        self.deliver(
            Channel::Chat,
            &chat.target_peer_id,
            &ChatInbound {
                sender_id: Some(sender),
                message: chat.message,
            },
        );
    }

    fn on_invite(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(invite) = Self::parse::<InviteRequest>(frame) else {
            return;
        };
        let match_id = Uuid::new_v4().to_string();
        let invitee = PeerId::from(invite.target_peer_id.clone());
        self.invites.insert(
            match_id.clone(),
            PendingInvite {
                inviter: sender.clone(),
                invitee: invitee.clone(),
            },
        );
        self.deliver(
            Channel::Game,
            &sender,
            &GameEvent::GameInviteSentConfirm {
                target_peer_id: Some(invite.target_peer_id),
            },
        );
        self.deliver(
            Channel::Game,
            &invitee,
            &GameEvent::GameInvite {
                sender_id: sender.to_string(),
                game_type: invite.game_type,
                match_id,
            },
        );
    }

    fn on_accept(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(accept) = Self::parse::<AcceptRequest>(frame) else {
            return;
        };
        let valid = self.invites.get(&accept.match_id).is_some_and(|invite| {
            invite.invitee == sender && invite.inviter == accept.target_peer_id.as_str()
        });
        if !valid {
            tracing::debug!(peer = %sender, match_id = %accept.match_id, "accept without matching invite");
            return;
        }
        let Some(invite) = self.invites.remove(&accept.match_id) else {
            return;
        };
        let game = KnockoutMatch::new(
            accept.match_id.clone(),
            invite.inviter.to_string(),
            invite.invitee.to_string(),
        );
        self.games.insert(accept.match_id.clone(), game);
        let start = GameEvent::GameStart {
            match_id: accept.match_id,
        };
        self.deliver(Channel::Game, &invite.inviter, &start);
        self.deliver(Channel::Game, &invite.invitee, &start);
    }

    fn on_move(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(request) = Self::parse::<MoveRequest>(frame) else {
            return;
        };
        let Some(game) = self.games.get_mut(&request.match_id) else {
            return;
        };
        let outcome = game.apply_shot(sender.as_str(), Shot::new(request.dx, request.dy));
        if outcome == ShotOutcome::Rejected {
            return;
        }
        let (one, two) = game.players();
        let players = [PeerId::from(one), PeerId::from(two)];
        let sync = game.state_sync();
        let announce = GameEvent::GameMoveAnnounce {
            match_id: request.match_id,
            sender_id: sender.to_string(),
            dx: request.dx,
            dy: request.dy,
        };
        let sync = GameEvent::GameStateSync(sync);
        for player in &players {
            self.deliver(Channel::Game, player, &announce);
        }
        for player in &players {
            self.deliver(Channel::Game, player, &sync);
        }
    }

    fn on_close(&mut self, sender: PeerId, frame: &RelayFrame) {
        let Some(request) = Self::parse::<CloseRequest>(frame) else {
            return;
        };
        let opponent = self
            .games
            .get(&request.match_id)
            .and_then(|game| game.opponent_of(sender.as_str()))
            .map(PeerId::from);
        let Some(opponent) = opponent else {
            return;
        };
        self.games.remove(&request.match_id);
        self.deliver(
            Channel::Game,
            &opponent,
            &GameEvent::GameClosed {
                match_id: request.match_id,
            },
        );
    }
}
