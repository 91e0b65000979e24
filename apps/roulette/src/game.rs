//! Client side of the Knockout mini-game, scoped to one match session.
//!
//! The relay is authoritative. Announced moves are replayed locally for an
//! immediate result and overwritten by the next state sync.

use knockout_proto::{
    AcceptRequest, CloseRequest, GAME_KNOCKOUT, GameEvent, InviteRequest, KnockoutMatch,
    MoveRequest, Shot, ShotOutcome,
};

use crate::identity::PeerId;

#[derive(Debug, Clone, PartialEq)]
pub enum GamePhase {
    Idle,
    InviteSent,
    Invited { match_id: String },
    Playing,
    Finished { winner: Option<PeerId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameUpdate {
    InviteSent,
    Invited { match_id: String },
    Started { match_id: String, my_turn: bool },
    Moved { by: PeerId, my_turn: bool },
    Synced(ScoreBoard),
    Closed { match_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBoard {
    pub round: u32,
    pub mine: u32,
    pub partner: u32,
    pub my_turn: bool,
    pub winner: Option<PeerId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GameError {
    #[error("no invite to accept")]
    NoInvite,
    #[error("a game is already in progress")]
    Busy,
    #[error("no game in progress")]
    NotPlaying,
    #[error("not your turn")]
    NotYourTurn,
}

#[derive(Debug)]
pub struct GameTable {
    me: PeerId,
    partner: PeerId,
    phase: GamePhase,
    inviter: Option<PeerId>,
    current: Option<KnockoutMatch>,
}

impl GameTable {
    pub fn new(me: PeerId, partner: PeerId) -> Self {
        Self {
            me,
            partner,
            phase: GamePhase::Idle,
            inviter: None,
            current: None,
        }
    }

    pub fn phase(&self) -> &GamePhase {
        &self.phase
    }

    pub fn current(&self) -> Option<&KnockoutMatch> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.phase = GamePhase::Idle;
        self.inviter = None;
        self.current = None;
    }

    pub fn invite(&mut self) -> Result<InviteRequest, GameError> {
        if matches!(self.phase, GamePhase::Playing | GamePhase::InviteSent) {
            return Err(GameError::Busy);
        }
        self.phase = GamePhase::InviteSent;
        self.inviter = Some(self.me.clone());
        Ok(InviteRequest {
            target_peer_id: self.partner.to_string(),
            game_type: GAME_KNOCKOUT.to_string(),
        })
    }

    pub fn accept(&mut self) -> Result<AcceptRequest, GameError> {
        let GamePhase::Invited { match_id } = &self.phase else {
            return Err(GameError::NoInvite);
        };
        Ok(AcceptRequest {
            target_peer_id: self.partner.to_string(),
            match_id: match_id.clone(),
        })
    }

    pub fn shoot(&self, dx: f64, dy: f64) -> Result<MoveRequest, GameError> {
        let current = match (&self.phase, &self.current) {
            (GamePhase::Playing, Some(current)) => current,
            _ => return Err(GameError::NotPlaying),
        };
        if current.current_turn() != self.me.as_str() {
            return Err(GameError::NotYourTurn);
        }
        Ok(MoveRequest {
            match_id: current.match_id().to_string(),
            dx,
            dy,
        })
    }

    pub fn close(&mut self) -> Result<CloseRequest, GameError> {
        let match_id = self
            .current
            .as_ref()
            .map(|current| current.match_id().to_string())
            .ok_or(GameError::NotPlaying)?;
        self.reset();
        Ok(CloseRequest { match_id })
    }

    pub fn scoreboard(&self) -> Option<ScoreBoard> {
        let current = self.current.as_ref()?;
        Some(ScoreBoard {
            round: current.round(),
            mine: current.score_of(self.me.as_str()),
            partner: current.score_of(self.partner.as_str()),
            my_turn: current.current_turn() == self.me.as_str(),
            winner: current.winner().map(PeerId::from),
        })
    }

    fn my_turn(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.current_turn() == self.me.as_str())
    }

    fn is_current(&self, match_id: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.match_id() == match_id)
    }

    /// Applies one inbound event. Events naming anyone but the current
    /// partner, or a match other than the current one, are dropped.
    pub fn on_event(&mut self, event: GameEvent) -> Option<GameUpdate> {
        match event {
            GameEvent::GameInviteSentConfirm { target_peer_id } => {
                if target_peer_id.is_some_and(|target| target != self.partner.as_str()) {
                    return None;
                }
                Some(GameUpdate::InviteSent)
            }
            GameEvent::GameInvite {
                sender_id,
                game_type,
                match_id,
            } => {
                if sender_id != self.partner.as_str() || game_type != GAME_KNOCKOUT {
                    tracing::debug!(%sender_id, %game_type, "ignoring game invite");
                    return None;
                }
                if matches!(self.phase, GamePhase::Playing) {
                    return None;
                }
                self.phase = GamePhase::Invited {
                    match_id: match_id.clone(),
                };
                self.inviter = Some(self.partner.clone());
                Some(GameUpdate::Invited { match_id })
            }
            GameEvent::GameStart { match_id } => {
                let (one, two) = match &self.inviter {
                    Some(inviter) if *inviter == self.me => (&self.me, &self.partner),
                    Some(_) => (&self.partner, &self.me),
                    None => return None,
                };
                self.current = Some(KnockoutMatch::new(
                    match_id.clone(),
                    one.to_string(),
                    two.to_string(),
                ));
                self.phase = GamePhase::Playing;
                Some(GameUpdate::Started {
                    match_id,
                    my_turn: self.my_turn(),
                })
            }
            GameEvent::GameMoveAnnounce {
                match_id,
                sender_id,
                dx,
                dy,
            } => {
                if !self.is_current(&match_id) {
                    return None;
                }
                let current = self.current.as_mut()?;
                if current.apply_shot(&sender_id, Shot::new(dx, dy)) == ShotOutcome::Rejected {
                    return None;
                }
                Some(GameUpdate::Moved {
                    by: PeerId::from(sender_id),
                    my_turn: self.my_turn(),
                })
            }
            GameEvent::GameStateSync(sync) => {
                if !self.is_current(&sync.match_id) {
                    return None;
                }
                self.current.as_mut()?.reconcile(&sync);
                let board = self.scoreboard()?;
                if board.winner.is_some() {
                    self.phase = GamePhase::Finished {
                        winner: board.winner.clone(),
                    };
                }
                Some(GameUpdate::Synced(board))
            }
            GameEvent::GameClosed { match_id } => {
                if !self.is_current(&match_id) {
                    return None;
                }
                self.reset();
                Some(GameUpdate::Closed { match_id })
            }
        }
    }
}
