//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (empty = any origin)
    pub client_origins: Vec<String>,
    /// Per-room gameplay tuning
    pub game: GameConfig,
}

/// How client-reported moves are checked before they touch the world
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveValidation {
    /// Accept every move, clamped to the world rect
    Trust,
    /// Reject moves faster than the player could drive or after session expiry
    SpeedLimit,
}

impl FromStr for MoveValidation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust" => Ok(Self::Trust),
            "speed_limit" | "speed-limit" => Ok(Self::SpeedLimit),
            _ => Err(()),
        }
    }
}

/// Gameplay tuning shared by every room
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Fixed seed for world generation (random per room when unset)
    pub world_seed: Option<u64>,
    /// Match countdown in seconds
    pub match_duration_secs: f32,
    /// Deliveries needed for victory; also the number of targets placed
    pub required_deliveries: usize,
    /// Starting throw pool per player
    pub throws_per_player: u32,
    /// Autonomous vehicles per match
    pub vehicle_count: usize,
    pub move_validation: MoveValidation,
    pub max_players: usize,
    /// How long a room may sit empty before its task shuts down
    pub room_idle_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            world_seed: None,
            match_duration_secs: 180.0,
            required_deliveries: 10,
            throws_per_player: 15,
            vehicle_count: 6,
            move_validation: MoveValidation::Trust,
            max_players: 16,
            room_idle_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT wins when a hosting platform provides it
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let client_origins = env::var("CLIENT_ORIGIN")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origins,
            game: GameConfig::from_env()?,
        })
    }
}

impl GameConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let required_deliveries = parse_var("REQUIRED_DELIVERIES", defaults.required_deliveries)?;
        if required_deliveries == 0 {
            return Err(ConfigError::Invalid("REQUIRED_DELIVERIES"));
        }
        let match_duration_secs: f32 =
            parse_var("MATCH_DURATION_SECS", defaults.match_duration_secs)?;
        if !(match_duration_secs.is_finite() && match_duration_secs > 0.0) {
            return Err(ConfigError::Invalid("MATCH_DURATION_SECS"));
        }

        Ok(Self {
            world_seed: parse_optional_var("WORLD_SEED")?,
            match_duration_secs,
            required_deliveries,
            throws_per_player: parse_var("THROWS_PER_PLAYER", defaults.throws_per_player)?,
            vehicle_count: parse_var("VEHICLE_COUNT", defaults.vehicle_count)?,
            move_validation: parse_var("MOVE_VALIDATION", defaults.move_validation)?,
            max_players: parse_var("MAX_PLAYERS_PER_ROOM", defaults.max_players)?,
            room_idle_secs: parse_var("ROOM_IDLE_SECS", defaults.room_idle_secs)?,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn parse_optional_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
