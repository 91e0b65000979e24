use crate::messages::{PuckState, StateSync};
use crate::physics::{simulate, Puck};
use crate::Shot;

pub const ROUNDS_TO_WIN: u32 = 2;

const PLAYER_ONE_START: (f64, f64) = (-0.3, 0.0);
const PLAYER_TWO_START: (f64, f64) = (0.3, 0.0);

#[derive(Debug, Clone, PartialEq)]
pub enum ShotOutcome {
    /// The shooter does not hold the turn, or the match is already decided.
    Rejected,
    Played {
        /// Set when the shot ended a round; `None` inside means a draw.
        round_winner: Option<Option<String>>,
        match_over: bool,
    },
}

/// Authoritative state of one Knockout match.
///
/// Player one is whoever sent the invite. Pucks are addressed by player id,
/// never by slot, so callers cannot mix up whose puck moved.
#[derive(Debug, Clone)]
pub struct KnockoutMatch {
    match_id: String,
    player_one: String,
    player_two: String,
    pucks: [Puck; 2],
    current_turn: String,
    scores: [u32; 2],
    round: u32,
    winner: Option<String>,
}

impl KnockoutMatch {
    pub fn new(
        match_id: impl Into<String>,
        player_one: impl Into<String>,
        player_two: impl Into<String>,
    ) -> Self {
        let player_one = player_one.into();
        Self {
            match_id: match_id.into(),
            current_turn: player_one.clone(),
            player_one,
            player_two: player_two.into(),
            pucks: starting_pucks(),
            scores: [0, 0],
            round: 1,
            winner: None,
        }
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn players(&self) -> (&str, &str) {
        (&self.player_one, &self.player_two)
    }

    pub fn opponent_of(&self, player: &str) -> Option<&str> {
        if player == self.player_one {
            Some(&self.player_two)
        } else if player == self.player_two {
            Some(&self.player_one)
        } else {
            None
        }
    }

    pub fn current_turn(&self) -> &str {
        &self.current_turn
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn score_of(&self, player: &str) -> u32 {
        self.slot(player).map_or(0, |slot| self.scores[slot])
    }

    pub fn puck_of(&self, player: &str) -> Option<&Puck> {
        self.slot(player).map(|slot| &self.pucks[slot])
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn is_over(&self) -> bool {
        self.winner.is_some()
    }

    fn slot(&self, player: &str) -> Option<usize> {
        if player == self.player_one {
            Some(0)
        } else if player == self.player_two {
            Some(1)
        } else {
            None
        }
    }

    pub fn apply_shot(&mut self, player: &str, shot: Shot) -> ShotOutcome {
        if self.is_over() || player != self.current_turn {
            tracing::debug!(
                match_id = %self.match_id,
                player,
                turn = %self.current_turn,
                "shot rejected"
            );
            return ShotOutcome::Rejected;
        }
        let Some(slot) = self.slot(player) else {
            return ShotOutcome::Rejected;
        };

        self.pucks[slot].strike(shot);
        simulate(&mut self.pucks);

        let one_out = self.pucks[0].is_out();
        let two_out = self.pucks[1].is_out();
        if !one_out && !two_out {
            self.pass_turn();
            return ShotOutcome::Played {
                round_winner: None,
                match_over: false,
            };
        }

        let round_winner = match (one_out, two_out) {
            (false, true) => {
                self.scores[0] += 1;
                Some(self.player_one.clone())
            }
            (true, false) => {
                self.scores[1] += 1;
                Some(self.player_two.clone())
            }
            _ => None,
        };
        tracing::info!(
            match_id = %self.match_id,
            round = self.round,
            score_one = self.scores[0],
            score_two = self.scores[1],
            winner = round_winner.as_deref().unwrap_or("draw"),
            "round complete"
        );

        let match_over = self.scores.iter().any(|score| *score >= ROUNDS_TO_WIN);
        if match_over {
            self.winner = round_winner.clone();
        } else {
            self.reset_round();
        }
        ShotOutcome::Played {
            round_winner: Some(round_winner),
            match_over,
        }
    }

    fn pass_turn(&mut self) {
        self.current_turn = if self.current_turn == self.player_one {
            self.player_two.clone()
        } else {
            self.player_one.clone()
        };
    }

    fn reset_round(&mut self) {
        self.pucks = starting_pucks();
        self.current_turn = self.player_one.clone();
        self.round += 1;
    }

    /// Overwrites local state with an authoritative snapshot. Pucks carrying a
    /// `player_id` are matched by owner; anonymous pucks fall back to slot order.
    pub fn reconcile(&mut self, sync: &StateSync) {
        for (index, state) in sync.pucks.iter().enumerate() {
            let slot = match state.player_id.as_deref() {
                Some(owner) => self.slot(owner),
                None => (index < 2).then_some(index),
            };
            if let Some(slot) = slot {
                self.pucks[slot] = state.to_puck();
            }
        }
        if self.slot(&sync.current_turn).is_some() {
            self.current_turn = sync.current_turn.clone();
        }
        self.scores = [sync.player1_score, sync.player2_score];
        self.round = sync.round;
        self.winner = if sync.round_over {
            sync.winner.clone().filter(|winner| self.slot(winner).is_some())
        } else {
            None
        };
    }

    /// Snapshot broadcast to both players after every accepted shot.
    pub fn state_sync(&self) -> StateSync {
        let owners = [&self.player_one, &self.player_two];
        StateSync {
            match_id: self.match_id.clone(),
            pucks: owners
                .iter()
                .zip(self.pucks.iter())
                .map(|(owner, puck)| PuckState::from_puck(owner, puck))
                .collect(),
            current_turn: self.current_turn.clone(),
            player1_id: Some(self.player_one.clone()),
            player2_id: Some(self.player_two.clone()),
            player1_score: self.scores[0],
            player2_score: self.scores[1],
            round: self.round,
            round_over: self.is_over(),
            winner: self.winner.clone(),
        }
    }
}

fn starting_pucks() -> [Puck; 2] {
    [
        Puck::at(PLAYER_ONE_START.0, PLAYER_ONE_START.1),
        Puck::at(PLAYER_TWO_START.0, PLAYER_TWO_START.1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knock_out(game: &mut KnockoutMatch, shooter: &str) -> ShotOutcome {
        // aim at the opponent, hard enough to push them off the right edge
        let direction = if shooter == game.players().0 { 4.0 } else { -4.0 };
        game.apply_shot(shooter, Shot::new(direction, 0.0))
    }

    #[test]
    fn inviter_shoots_first_and_turns_alternate() {
        let mut game = KnockoutMatch::new("m1", "alice", "bob");
        assert_eq!(game.current_turn(), "alice");
        assert_eq!(game.apply_shot("bob", Shot::new(0.0, 0.1)), ShotOutcome::Rejected);

        let outcome = game.apply_shot("alice", Shot::new(0.0, 0.1));
        assert_eq!(
            outcome,
            ShotOutcome::Played {
                round_winner: None,
                match_over: false
            }
        );
        assert_eq!(game.current_turn(), "bob");
    }

    #[test]
    fn stranger_cannot_shoot() {
        let mut game = KnockoutMatch::new("m1", "alice", "bob");
        assert_eq!(game.apply_shot("carol", Shot::new(1.0, 0.0)), ShotOutcome::Rejected);
        assert_eq!(game.opponent_of("carol"), None);
    }

    #[test]
    fn knocking_opponent_off_scores_and_resets_round() {
        let mut game = KnockoutMatch::new("m1", "alice", "bob");
        let outcome = knock_out(&mut game, "alice");
        let ShotOutcome::Played { round_winner, match_over } = outcome else {
            panic!("shot should be played");
        };
        assert!(!match_over);
        let winner = round_winner.expect("round should end");
        assert_eq!(game.round(), 2);
        assert_eq!(game.current_turn(), "alice");
        assert_eq!(game.puck_of("alice"), Some(&Puck::at(-0.3, 0.0)));
        if let Some(winner) = winner {
            assert_eq!(game.score_of(&winner), 1);
        }
    }

    #[test]
    fn best_of_three_ends_match() {
        let mut game = KnockoutMatch::new("m1", "alice", "bob");
        let mut rounds = 0;
        while !game.is_over() && rounds < 20 {
            knock_out(&mut game, "alice");
            rounds += 1;
        }
        assert!(game.is_over(), "match should finish");
        let winner = game.winner().expect("winner").to_string();
        assert_eq!(game.score_of(&winner), ROUNDS_TO_WIN);
        assert_eq!(game.apply_shot("alice", Shot::new(1.0, 0.0)), ShotOutcome::Rejected);
        assert!(game.state_sync().round_over);
    }

    #[test]
    fn reconcile_matches_pucks_by_owner() {
        let mut authority = KnockoutMatch::new("m1", "alice", "bob");
        authority.apply_shot("alice", Shot::new(0.0, 0.5));
        let mut sync = authority.state_sync();
        sync.pucks.reverse();

        let mut mirror = KnockoutMatch::new("m1", "alice", "bob");
        mirror.reconcile(&sync);
        assert_eq!(
            mirror.puck_of("alice").map(|p| (p.x, p.y)),
            authority.puck_of("alice").map(|p| (p.x, p.y))
        );
        assert_eq!(mirror.current_turn(), "bob");
    }

    #[test]
    fn state_sync_keys_pucks_by_player() {
        let game = KnockoutMatch::new("m1", "alice", "bob");
        let sync = game.state_sync();
        assert_eq!(sync.pucks.len(), 2);
        assert_eq!(sync.pucks[0].player_id.as_deref(), Some("alice"));
        assert_eq!(sync.pucks[1].player_id.as_deref(), Some("bob"));
        assert_eq!(sync.current_turn, "alice");
    }
}
