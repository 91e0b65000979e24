use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::media::MediaConfig;
use crate::protocol::Destinations;
use crate::relay::{BackoffConfig, StompRelayConfig};
use crate::skip_guard::SkipLimit;
use crate::transport::IceServerConfig;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the STOMP relay.
    pub relay_url: String,
    pub publish_prefix: String,
    pub subscribe_prefix: String,
    /// STOMP heart-beat period in milliseconds; 0 disables it.
    pub heartbeat_ms: u64,
    /// Matchmaking pool tag sent as the join body.
    pub cohort: String,
    /// Pause before the initiator sends its first offer, giving the
    /// responder time to finish subscribing.
    pub initiator_delay: Duration,
    pub reconnect: BackoffConfig,
    pub ice_servers: Vec<IceServerConfig>,
    /// Host candidates only; no public STUN/TURN servers are contacted.
    pub localhost_only: bool,
    pub max_ice_restarts: u32,
    /// How long a restarted ICE session may take to reconnect before the
    /// partner is treated as lost.
    pub ice_restart_timeout: Duration,
    pub media: MediaConfig,
    pub skip_limit: SkipLimit,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.into(),
            publish_prefix: "/app".into(),
            subscribe_prefix: "/topic".into(),
            heartbeat_ms: 10_000,
            cohort: "default".into(),
            initiator_delay: Duration::from_millis(1_000),
            reconnect: BackoffConfig::default(),
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            localhost_only: false,
            max_ice_restarts: 1,
            ice_restart_timeout: Duration::from_secs(15),
            media: MediaConfig::default(),
            skip_limit: SkipLimit::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `ROULETTE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Self::default();

        let relay_url = match vars.get("ROULETTE_RELAY_URL") {
            Some(raw) => parse_relay_url(&raw)?.to_string(),
            None => defaults.relay_url,
        };

        let reconnect = BackoffConfig {
            initial: vars
                .millis("ROULETTE_RECONNECT_INITIAL_MS")?
                .unwrap_or(defaults.reconnect.initial),
            max: vars
                .millis("ROULETTE_RECONNECT_MAX_MS")?
                .unwrap_or(defaults.reconnect.max),
            max_attempts: vars
                .parse::<u32>("ROULETTE_RECONNECT_MAX_ATTEMPTS")?
                .filter(|attempts| *attempts > 0),
            ..defaults.reconnect
        };

        let localhost_only = vars.flag("ROULETTE_LOCALHOST_ONLY").unwrap_or(false);
        let ice_servers = if localhost_only {
            Vec::new()
        } else {
            match vars.get("ROULETTE_ICE_SERVERS") {
                Some(raw) => parse_ice_servers(
                    &raw,
                    vars.get("ROULETTE_TURN_USERNAME"),
                    vars.get("ROULETTE_TURN_CREDENTIAL"),
                ),
                None => defaults.ice_servers,
            }
        };

        let media = MediaConfig {
            audio: vars.flag("ROULETTE_AUDIO").unwrap_or(defaults.media.audio),
            video: vars.flag("ROULETTE_VIDEO").unwrap_or(defaults.media.video),
            audio_device: vars.get("ROULETTE_AUDIO_DEVICE"),
            video_device: vars.get("ROULETTE_VIDEO_DEVICE"),
        };

        let skip_limit = SkipLimit {
            max_attempts: vars
                .parse("ROULETTE_SKIP_MAX")?
                .unwrap_or(defaults.skip_limit.max_attempts),
            window: vars
                .millis("ROULETTE_SKIP_WINDOW_MS")?
                .unwrap_or(defaults.skip_limit.window),
            cooldown: vars
                .millis("ROULETTE_SKIP_COOLDOWN_MS")?
                .unwrap_or(defaults.skip_limit.cooldown),
        };

        Ok(Self {
            relay_url,
            publish_prefix: vars
                .get("ROULETTE_PUBLISH_PREFIX")
                .unwrap_or(defaults.publish_prefix),
            subscribe_prefix: vars
                .get("ROULETTE_SUBSCRIBE_PREFIX")
                .unwrap_or(defaults.subscribe_prefix),
            heartbeat_ms: vars
                .parse("ROULETTE_HEARTBEAT_MS")?
                .unwrap_or(defaults.heartbeat_ms),
            cohort: vars.get("ROULETTE_COHORT").unwrap_or(defaults.cohort),
            initiator_delay: vars
                .millis("ROULETTE_INITIATOR_DELAY_MS")?
                .unwrap_or(defaults.initiator_delay),
            reconnect,
            ice_servers,
            localhost_only,
            max_ice_restarts: vars
                .parse("ROULETTE_MAX_ICE_RESTARTS")?
                .unwrap_or(defaults.max_ice_restarts),
            ice_restart_timeout: vars
                .millis("ROULETTE_ICE_RESTART_TIMEOUT_MS")?
                .unwrap_or(defaults.ice_restart_timeout),
            media,
            skip_limit,
        })
    }

    pub fn destinations(&self) -> Destinations {
        Destinations::new(&*self.publish_prefix, &*self.subscribe_prefix)
    }

    pub fn stomp(&self) -> Result<StompRelayConfig, ConfigError> {
        let mut stomp = StompRelayConfig::new(parse_relay_url(&self.relay_url)?);
        stomp.heartbeat = (self.heartbeat_ms, self.heartbeat_ms);
        stomp.reconnect = self.reconnect.clone();
        Ok(stomp)
    }
}

pub fn parse_relay_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "ROULETTE_RELAY_URL",
        value: raw.to_string(),
        reason,
    };
    // Normalize localhost to IPv4 to avoid an IPv6 (::1) preference
    let normalized = raw.replacen("://localhost", "://127.0.0.1", 1);
    let url = Url::parse(&normalized).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

fn parse_ice_servers(
    raw: &str,
    username: Option<String>,
    credential: Option<String>,
) -> Vec<IceServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| {
            let mut server = IceServerConfig::stun(url);
            if url.starts_with("turn:") || url.starts_with("turns:") {
                server.username = username.clone();
                server.credential = credential.clone();
            }
            server
        })
        .collect()
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                var: key,
                value: raw.clone(),
                reason: err.to_string(),
            })
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
    }
}
