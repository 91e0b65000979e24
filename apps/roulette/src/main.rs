use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_bus::{LocalBus, LocalRelay, Relay};
use roulette_core::chat::ChatSender;
use roulette_core::config::ClientConfig;
use roulette_core::engine::{EngineHandle, EngineNotification, EngineOptions, PairingEngine};
use roulette_core::game::GameUpdate;
use roulette_core::media::{MediaProvider, StaticMedia};
use roulette_core::relay::{LocalBroker, StompRelay};
use roulette_core::telemetry::{self, LogConfig, LogLevel};
use roulette_core::transport::{MockTransportFactory, TransportFactory, WebRtcTransportFactory};
use roulette_core::LocalIdentity;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "roulette", about = "Random one-to-one video pairing over a STOMP relay")]
struct Cli {
    /// Relay WebSocket URL (overrides ROULETTE_RELAY_URL)
    #[arg(long)]
    relay: Option<String>,

    /// Matchmaking cohort
    #[arg(long)]
    cohort: Option<String>,

    /// Fixed peer id instead of a random one
    #[arg(long)]
    id: Option<String>,

    #[arg(long, help = "Use host candidates only")]
    localhost_only: bool,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_video: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Pair with an in-process peer over a local broker")]
    demo: bool,
}

#[derive(Debug, PartialEq)]
enum Input {
    Next,
    Quit,
    ChatView(bool),
    Invite,
    Accept,
    Shoot(f64, f64),
    EndGame,
    Chat(String),
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Input::Chat(line.to_string()));
    }
    let mut parts = line.split_whitespace();
    let input = match (parts.next(), parts.next()) {
        (Some("/next"), _) => Input::Next,
        (Some("/quit"), _) => Input::Quit,
        (Some("/chat"), Some("open")) => Input::ChatView(true),
        (Some("/chat"), Some("close")) => Input::ChatView(false),
        (Some("/invite"), _) => Input::Invite,
        (Some("/accept"), _) => Input::Accept,
        (Some("/endgame"), _) => Input::EndGame,
        (Some("/shoot"), Some(dx)) => {
            match (dx.parse::<f64>(), parts.next().map(str::parse::<f64>)) {
                (Ok(dx), Some(Ok(dy))) => Input::Shoot(dx, dy),
                _ => Input::Unknown(line.to_string()),
            }
        }
        _ => Input::Unknown(line.to_string()),
    };
    Some(input)
}

fn describe(notification: &EngineNotification) -> String {
    match notification {
        EngineNotification::Status(status) => format!("status: {status}"),
        EngineNotification::Matched { partner, initiator } => {
            format!("matched with {partner} (initiator: {initiator})")
        }
        EngineNotification::PartnerConnected { partner } => format!("media connected to {partner}"),
        EngineNotification::PartnerLeft { partner, reason } => format!("{partner} gone: {reason}"),
        EngineNotification::RemoteTrack(track) => format!("remote {} track {}", track.kind, track.track_id),
        EngineNotification::Chat(message) => match message.sender {
            ChatSender::Local => format!("you: {}", message.text),
            ChatSender::Partner => format!("stranger: {}", message.text),
        },
        EngineNotification::UnreadChat { count } => format!("{count} unread"),
        EngineNotification::SkipThrottled { retry_in } => {
            format!("slow down, next skip in {:.1}s", retry_in.as_secs_f64())
        }
        EngineNotification::Game(update) => match update {
            GameUpdate::InviteSent => "game invite sent".into(),
            GameUpdate::Invited { .. } => "invited to knockout, /accept to play".into(),
            GameUpdate::Started { my_turn, .. } => format!("game started (your turn: {my_turn})"),
            GameUpdate::Moved { by, my_turn } => format!("{by} shot (your turn: {my_turn})"),
            GameUpdate::Synced(board) => format!(
                "round {} score {}-{}{}",
                board.round,
                board.mine,
                board.partner,
                board
                    .winner
                    .as_ref()
                    .map(|winner| format!(", winner {winner}"))
                    .unwrap_or_default()
            ),
            GameUpdate::Closed { .. } => "game closed".into(),
        },
    }
}

fn spawn_printer(label: &'static str, engine: &EngineHandle) -> JoinHandle<()> {
    let mut notifications = engine.notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => println!("[{label}] {}", describe(&notification)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn drive(engine: &EngineHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse_input(&line) else {
            continue;
        };
        match input {
            Input::Next => engine.next()?,
            Input::Quit => break,
            Input::ChatView(open) => engine.set_chat_open(open)?,
            Input::Invite => engine.invite_game()?,
            Input::Accept => engine.accept_game()?,
            Input::Shoot(dx, dy) => engine.shoot(dx, dy)?,
            Input::EndGame => engine.close_game()?,
            Input::Chat(text) => engine.send_chat(text)?,
            Input::Unknown(line) => eprintln!(
                "unknown command `{line}` (try /next, /chat open|close, /invite, /accept, /shoot dx dy, /endgame, /quit)"
            ),
        }
    }
    Ok(())
}

async fn run_demo(config: &ClientConfig, identity: LocalIdentity) -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let _broker = LocalBroker::spawn(bus.clone(), config.destinations());
    let spawn = |identity: LocalIdentity| {
        let relay: Arc<dyn Relay> = LocalRelay::new(bus.clone());
        let transports: Arc<dyn TransportFactory> = MockTransportFactory::new();
        PairingEngine::spawn(
            identity,
            relay,
            transports,
            Arc::new(StaticMedia {
                audio: true,
                video: true,
            }),
            EngineOptions::from_config(config),
        )
    };
    let me = spawn(identity);
    let stranger = spawn(LocalIdentity::generate());
    println!("you are {} (demo partner {})", me.identity(), stranger.identity());
    let printers = [spawn_printer("you", &me), spawn_printer("stranger", &stranger)];

    let result = drive(&me).await;
    me.shutdown().await.ok();
    stranger.shutdown().await.ok();
    for printer in printers {
        printer.abort();
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = ClientConfig::from_env()?;
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if let Some(cohort) = cli.cohort {
        config.cohort = cohort;
    }
    if cli.localhost_only {
        config.localhost_only = true;
        config.ice_servers.clear();
    }
    config.media.audio &= !cli.no_audio;
    config.media.video &= !cli.no_video;

    let identity = match cli.id {
        Some(id) => LocalIdentity::with_id(id),
        None => LocalIdentity::generate(),
    };

    if cli.demo {
        return run_demo(&config, identity).await;
    }

    let relay: Arc<dyn Relay> = StompRelay::new(config.stomp()?);
    let transports: Arc<dyn TransportFactory> = Arc::new(
        WebRtcTransportFactory::new(&config.ice_servers)
            .context("failed to set up the WebRTC stack")?,
    );
    let media: Arc<dyn MediaProvider> = Arc::new(StaticMedia {
        audio: config.media.audio,
        video: config.media.video,
    });

    tracing::info!(relay = %config.relay_url, cohort = %config.cohort, "starting");
    let engine = PairingEngine::spawn(
        identity,
        relay,
        transports,
        media,
        EngineOptions::from_config(&config),
    );
    println!("you are {}", engine.identity());
    let printer = spawn_printer("roulette", &engine);

    let result = drive(&engine).await;
    engine.shutdown().await.ok();
    printer.abort();
    result
}
