//! Wire messages and rules for the Knockout mini-game.
//! Kept in its own crate so the in-process broker and the client share one
//! copy of the physics without pulling in the networking stack.

mod messages;
mod physics;
mod rules;

pub use messages::{
    AcceptRequest, CloseRequest, GameEvent, InviteRequest, MoveRequest, PuckState, StateSync,
};
pub use physics::{simulate, Puck, PLATFORM_RADIUS, PUCK_RADIUS};
pub use rules::{KnockoutMatch, ShotOutcome, ROUNDS_TO_WIN};

/// Value carried in `gameType` for this game.
pub const GAME_KNOCKOUT: &str = "KNOCKOUT";

/// A drag vector supplied by the shooting player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shot {
    pub dx: f64,
    pub dy: f64,
}

impl Shot {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }
}
