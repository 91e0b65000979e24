pub mod chat;
pub mod config;
pub mod engine;
pub mod game;
pub mod identity;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod relay;
pub mod skip_guard;
pub mod telemetry;
pub mod transport;

pub use engine::{EngineHandle, EngineNotification, PairingEngine, SessionSnapshot, SessionStatus};
pub use identity::{LocalIdentity, PeerId};
