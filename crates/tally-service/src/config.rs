//! Tally service configuration.
//!
//! Configuration is loaded from environment variables. Capacities must be
//! positive; an unparseable or zero value is an error rather than a silent
//! default.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default participant cap per room.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 20;

/// Default cap on active rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default per-subscriber notification queue depth.
pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 16;

/// Default broadcaster mailbox depth above which the mailbox is reported
/// congested. The mailbox itself is unbounded.
pub const DEFAULT_BROADCASTER_MAILBOX: usize = 64;

/// Default time a torn-down room stays resolvable.
pub const DEFAULT_INACTIVE_ROOM_RETENTION_SECONDS: u64 = 3600;

/// Default interval between inactive-room sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Default graceful shutdown deadline.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 10;

/// Per-room settings handed to every room at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    pub max_participants: usize,
    pub subscriber_queue_depth: usize,
    /// Mailbox warning depth; critical is three times this.
    pub broadcaster_mailbox: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            subscriber_queue_depth: DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
            broadcaster_mailbox: DEFAULT_BROADCASTER_MAILBOX,
        }
    }
}

/// Tally service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/SSE bind address (default: "0.0.0.0:8090").
    pub http_bind_address: String,

    pub room: RoomSettings,

    /// Maximum concurrently active rooms.
    pub max_rooms: usize,

    /// How long a torn-down room answers `RoomInactive` before removal.
    pub inactive_room_retention: Duration,

    pub sweep_interval: Duration,

    pub shutdown_timeout: Duration,

    /// Emit logs as JSON.
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let http_bind_address = vars
            .get("TALLY_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());
        if http_bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "TALLY_HTTP_BIND_ADDRESS must be host:port, got '{http_bind_address}'"
            )));
        }

        let room = RoomSettings {
            max_participants: positive(vars, "TALLY_MAX_PARTICIPANTS", DEFAULT_MAX_PARTICIPANTS)?,
            subscriber_queue_depth: positive(
                vars,
                "TALLY_SUBSCRIBER_QUEUE_DEPTH",
                DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
            )?,
            broadcaster_mailbox: positive(
                vars,
                "TALLY_BROADCASTER_MAILBOX",
                DEFAULT_BROADCASTER_MAILBOX,
            )?,
        };

        let max_rooms = positive(vars, "TALLY_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;

        // Zero retention is allowed: rooms are removed on the next sweep.
        let inactive_room_retention = Duration::from_secs(parse_or(
            vars,
            "TALLY_INACTIVE_ROOM_RETENTION_SECONDS",
            DEFAULT_INACTIVE_ROOM_RETENTION_SECONDS,
        )?);

        let sweep_interval = Duration::from_secs(positive(
            vars,
            "TALLY_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?);

        let shutdown_timeout = Duration::from_secs(parse_or(
            vars,
            "TALLY_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?);

        let log_json = match vars.get("TALLY_LOG_JSON").map(String::as_str) {
            None => false,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
            Some(v) => {
                return Err(ConfigError::InvalidValue(format!(
                    "TALLY_LOG_JSON must be true or false, got '{v}'"
                )))
            }
        };

        Ok(Config {
            http_bind_address,
            room,
            max_rooms,
            inactive_room_retention,
            sweep_interval,
            shutdown_timeout,
            log_json,
        })
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

fn positive<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let value = parse_or(vars, key, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{key} must be greater than zero")));
    }
    Ok(value)
}
