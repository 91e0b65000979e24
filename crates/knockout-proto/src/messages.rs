use serde::{Deserialize, Serialize};

use crate::physics::Puck;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub target_peer_id: String,
    pub game_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub target_peer_id: String,
    pub match_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub match_id: String,
    pub dx: f64,
    pub dy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub match_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PuckState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    #[serde(default)]
    pub vx: f64,
    #[serde(default)]
    pub vy: f64,
}

impl PuckState {
    pub fn from_puck(owner: &str, puck: &Puck) -> Self {
        Self {
            player_id: Some(owner.to_string()),
            x: puck.x,
            y: puck.y,
            radius: puck.radius,
            vx: puck.vx,
            vy: puck.vy,
        }
    }

    /// Position only; a synced puck is at rest.
    pub fn to_puck(&self) -> Puck {
        Puck {
            x: self.x,
            y: self.y,
            radius: self.radius,
            vx: 0.0,
            vy: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSync {
    pub match_id: String,
    pub pucks: Vec<PuckState>,
    pub current_turn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player1_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_id: Option<String>,
    pub player1_score: u32,
    pub player2_score: u32,
    pub round: u32,
    pub round_over: bool,
    #[serde(default)]
    pub winner: Option<String>,
}

/// Everything the relay delivers on a participant's game topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum GameEvent {
    GameInviteSentConfirm {
        #[serde(default)]
        target_peer_id: Option<String>,
    },
    GameInvite {
        sender_id: String,
        game_type: String,
        match_id: String,
    },
    GameStart {
        match_id: String,
    },
    GameMoveAnnounce {
        match_id: String,
        sender_id: String,
        dx: f64,
        dy: f64,
    },
    GameStateSync(StateSync),
    GameClosed {
        match_id: String,
    },
}
