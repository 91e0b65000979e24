//! Pairing engine: one actor task owns the relay session, the current match
//! session and the local media, and serializes every relay frame, transport
//! callback, timer and user command through a single queue.

use std::fmt;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::chat::ChatMessage;
use crate::config::ClientConfig;
use crate::game::{GamePhase, GameUpdate, ScoreBoard};
use crate::identity::PeerId;
use crate::media::MediaConfig;
use crate::negotiation::{NegotiationState, RemoteTrack};
use crate::protocol::Destinations;
use crate::skip_guard::SkipLimit;

mod actor;

pub use actor::PairingEngine;

const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Waiting for the first relay connection.
    Connecting,
    Searching,
    ConnectingToPartner,
    Connected,
    Reconnecting,
    Offline,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Searching => "searching",
            SessionStatus::ConnectingToPartner => "connecting to partner",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The local user skipped.
    Skipped,
    /// The partner sent BYE.
    PartnerLeft,
    ConnectionFailed,
    RelayLost,
    /// A new assignment replaced the session.
    Superseded,
    Shutdown,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LeaveReason::Skipped => "skipped",
            LeaveReason::PartnerLeft => "partner left",
            LeaveReason::ConnectionFailed => "connection failed",
            LeaveReason::RelayLost => "relay lost",
            LeaveReason::Superseded => "superseded",
            LeaveReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    Status(SessionStatus),
    Matched { partner: PeerId, initiator: bool },
    /// ICE reached connected for the current partner.
    PartnerConnected { partner: PeerId },
    PartnerLeft { partner: PeerId, reason: LeaveReason },
    RemoteTrack(RemoteTrack),
    Chat(ChatMessage),
    UnreadChat { count: usize },
    SkipThrottled { retry_in: Duration },
    Game(GameUpdate),
}

/// Point-in-time view of the engine for UIs and tests.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub identity: PeerId,
    pub status: SessionStatus,
    pub partner: Option<PeerId>,
    pub initiator: Option<bool>,
    pub negotiation: Option<NegotiationState>,
    pub generation: u64,
    pub pending_candidates: usize,
    pub chat: Vec<ChatMessage>,
    pub unread: usize,
    pub searching: bool,
    pub relay_connected: bool,
    pub game: Option<GamePhase>,
    pub scoreboard: Option<ScoreBoard>,
    pub remote_tracks: Vec<RemoteTrack>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cohort: String,
    pub destinations: Destinations,
    pub initiator_delay: Duration,
    pub max_ice_restarts: u32,
    pub ice_restart_timeout: Duration,
    pub skip_limit: SkipLimit,
    pub media: MediaConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            cohort: config.cohort.clone(),
            destinations: config.destinations(),
            initiator_delay: config.initiator_delay,
            max_ice_restarts: config.max_ice_restarts,
            ice_restart_timeout: config.ice_restart_timeout,
            skip_limit: config.skip_limit,
            media: config.media.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("pairing engine stopped")]
    Stopped,
}

#[derive(Debug)]
pub(crate) enum Command {
    Next,
    SendChat(String),
    SetChatOpen(bool),
    InviteGame,
    AcceptGame,
    Shoot { dx: f64, dy: f64 },
    CloseGame,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end of a running [`PairingEngine`]. The engine shuts down
/// once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    identity: PeerId,
    commands: mpsc::UnboundedSender<actor::EngineEvent>,
    status: watch::Receiver<SessionStatus>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl EngineHandle {
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Skip the current partner (or restart the search).
    pub fn next(&self) -> Result<(), EngineError> {
        self.send(Command::Next)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::SendChat(text.into()))
    }

    pub fn set_chat_open(&self, open: bool) -> Result<(), EngineError> {
        self.send(Command::SetChatOpen(open))
    }

    pub fn invite_game(&self) -> Result<(), EngineError> {
        self.send(Command::InviteGame)
    }

    pub fn accept_game(&self) -> Result<(), EngineError> {
        self.send(Command::AcceptGame)
    }

    pub fn shoot(&self, dx: f64, dy: f64) -> Result<(), EngineError> {
        self.send(Command::Shoot { dx, dy })
    }

    pub fn close_game(&self) -> Result<(), EngineError> {
        self.send(Command::CloseGame)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Resolves once the engine reports `want`.
    pub async fn wait_for_status(&self, want: SessionStatus) -> Result<(), EngineError> {
        let mut status = self.status.clone();
        loop {
            if *status.borrow_and_update() == want {
                return Ok(());
            }
            status.changed().await.map_err(|_| EngineError::Stopped)?;
        }
    }

    pub fn notifications(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    /// Sends BYE to the current partner, closes the relay and waits for the
    /// engine task to finish its teardown.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(actor::EngineEvent::Command(command))
            .map_err(|_| EngineError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_user_facing() {
        assert_eq!(SessionStatus::ConnectingToPartner.to_string(), "connecting to partner");
        assert_eq!(SessionStatus::Searching.as_str(), "searching");
        assert_eq!(LeaveReason::RelayLost.to_string(), "relay lost");
    }

    #[test]
    fn options_follow_client_config() {
        let mut config = ClientConfig::default();
        config.cohort = "late".into();
        config.max_ice_restarts = 3;
        let options = EngineOptions::from_config(&config);
        assert_eq!(options.cohort, "late");
        assert_eq!(options.max_ice_restarts, 3);
        assert_eq!(options.destinations, Destinations::default());
    }
}
