//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Where presence state and the cross-instance bus live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Redis hashes for presence, Redis pub/sub for the bus.
    Redis,
    /// In-process store and bus; a single broker instance only.
    Memory,
}

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:8082`).
    pub server_addr: SocketAddr,
    /// Redis connection URL (e.g. `redis://127.0.0.1/`).
    pub redis_url: String,
    pub backend: Backend,
    /// Prefix prepended to every bus channel name.
    pub bus_channel_prefix: String,
    /// Lifetime of a typing flag that is never explicitly cleared.
    pub typing_ttl: Duration,
    /// Expiry of a session's presence collection. `None` keeps entries until removed.
    pub presence_ttl: Option<Duration>,
    /// CORS origins; `*` allows any.
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    /// `development` or `production`.
    pub environment: String,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (environment, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let server_addr: SocketAddr = var("SERVER_ADDR", "0.0.0.0:8082")
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let backend = match var("BACKEND", "redis").to_lowercase().as_str() {
            "redis" => Backend::Redis,
            "memory" => Backend::Memory,
            other => return Err(ConfigLoadError::InvalidBackend(other.to_string())),
        };

        let typing_secs = parse_secs(&var("TYPING_TTL_SECS", "30"), "TYPING_TTL_SECS")?;
        let typing_ttl = Duration::from_secs(typing_secs);
        let presence_secs = parse_secs(&var("PRESENCE_TTL_SECS", "86400"), "PRESENCE_TTL_SECS")?;
        let presence_ttl = match presence_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let allowed_origins = var("ALLOWED_ORIGINS", "*")
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        Ok(Self {
            server_addr,
            redis_url: var("REDIS_URL", "redis://127.0.0.1/"),
            backend,
            bus_channel_prefix: lookup("BUS_CHANNEL_PREFIX").unwrap_or_default(),
            typing_ttl,
            presence_ttl,
            allowed_origins,
            allow_credentials: var("ALLOW_CREDENTIALS", "false") == "true",
            environment: var("ENVIRONMENT", "development"),
            log_level: var("LOG_LEVEL", "info"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Origins to enforce, or `None` when any origin is allowed.
    pub fn cors_origins(&self) -> Option<&[String]> {
        let wildcard = self.allowed_origins.is_empty() || self.allowed_origins[0] == "*";
        if self.is_production() && !wildcard {
            Some(&self.allowed_origins)
        } else {
            None
        }
    }
}

fn parse_secs(raw: &str, var: &'static str) -> Result<u64, ConfigLoadError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigLoadError::InvalidNumber { var })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("Invalid BACKEND: {0} (expected redis or memory)")]
    InvalidBackend(String),
    #[error("{var} must be a non-negative integer")]
    InvalidNumber { var: &'static str },
}
