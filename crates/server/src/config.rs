use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

/// Outbox relay timing and retry policy. The backoff curve and ceiling are
/// deployment policy, not code; tests pin explicit values.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_cap: Duration,
    pub max_retries: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            poll_interval: Duration::from_millis(1000),
            batch_size: 64,
            backoff_base: Duration::from_millis(2000),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_millis(300_000),
            max_retries: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub postgres_dsn: String,
    pub heartbeat_seconds: u64,
    pub handshake_timeout: Duration,
    pub send_queue_depth: usize,
    pub call_route_ttl: Duration,
    pub relay: RelaySettings,
    /// Development token directory: `token,principal;token,principal`.
    /// Production deployments inject their own `Authenticator` instead.
    pub static_tokens: Vec<(String, String)>,
}

/// Loads server configuration from the filesystem with environment
/// overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("VOLANT_BIND", map.remove("server.bind"))?)?;
    let postgres_dsn = required(override_env(
        "VOLANT_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let heartbeat_seconds = parse_u64(
        override_env("VOLANT_HEARTBEAT", map.remove("server.heartbeat"))?,
        30,
    )?;
    let handshake_timeout = parse_u64(
        override_env(
            "VOLANT_HANDSHAKE_TIMEOUT",
            map.remove("server.handshake_timeout"),
        )?,
        10,
    )?;
    let send_queue_depth = parse_u64(
        override_env(
            "VOLANT_SEND_QUEUE_DEPTH",
            map.remove("server.send_queue_depth"),
        )?,
        64,
    )? as usize;
    let call_route_ttl = parse_u64(
        override_env(
            "VOLANT_CALL_ROUTE_TTL",
            map.remove("signaling.call_route_ttl"),
        )?,
        120,
    )?;

    let relay_defaults = RelaySettings::default();
    let relay = RelaySettings {
        poll_interval: Duration::from_millis(parse_u64(
            override_env("VOLANT_RELAY_POLL_MS", map.remove("relay.poll_interval_ms"))?,
            relay_defaults.poll_interval.as_millis() as u64,
        )?),
        batch_size: parse_u64(
            override_env("VOLANT_RELAY_BATCH", map.remove("relay.batch_size"))?,
            relay_defaults.batch_size as u64,
        )? as usize,
        backoff_base: Duration::from_millis(parse_u64(
            override_env(
                "VOLANT_RELAY_BACKOFF_BASE_MS",
                map.remove("relay.backoff_base_ms"),
            )?,
            relay_defaults.backoff_base.as_millis() as u64,
        )?),
        backoff_multiplier: parse_f64(
            override_env(
                "VOLANT_RELAY_BACKOFF_MULTIPLIER",
                map.remove("relay.backoff_multiplier"),
            )?,
            relay_defaults.backoff_multiplier,
        )?,
        backoff_cap: Duration::from_millis(parse_u64(
            override_env(
                "VOLANT_RELAY_BACKOFF_CAP_MS",
                map.remove("relay.backoff_cap_ms"),
            )?,
            relay_defaults.backoff_cap.as_millis() as u64,
        )?),
        max_retries: parse_u64(
            override_env("VOLANT_RELAY_MAX_RETRIES", map.remove("relay.max_retries"))?,
            relay_defaults.max_retries as u64,
        )? as u32,
    };
    if relay.batch_size == 0
        || relay.max_retries == 0
        || relay.backoff_multiplier < 1.0
        || relay.poll_interval.is_zero()
    {
        return Err(ConfigError::Invalid);
    }

    let tokens_raw = override_env("VOLANT_STATIC_TOKENS", map.remove("auth.static_tokens"))?;
    let static_tokens = parse_tokens(tokens_raw.unwrap_or_default())?;

    Ok(ServerConfig {
        bind,
        postgres_dsn,
        heartbeat_seconds,
        handshake_timeout: Duration::from_secs(handshake_timeout),
        send_queue_depth,
        call_route_ttl: Duration::from_secs(call_route_ttl),
        relay,
        static_tokens,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_u64(value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}

fn parse_f64(value: Option<String>, default: f64) -> Result<f64, ConfigError> {
    match value {
        Some(raw) => raw.parse::<f64>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}

fn parse_tokens(raw: String) -> Result<Vec<(String, String)>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut tokens = Vec::new();
    for entry in raw.split(';') {
        if entry.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split(',').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        tokens.push((parts[0].trim().to_string(), parts[1].trim().to_string()));
    }
    Ok(tokens)
}
