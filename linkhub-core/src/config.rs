use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub websocket: WebSocketConfig,
    pub presence: PresenceConfig,
    pub auth: AuthConfig,
    pub platforms: PlatformsConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// IP published to the presence store; detected from the outbound interface when unset
    pub advertise_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8089,
            advertise_ip: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL selects the in-memory presence store (single instance)
    pub url: String,
    pub key_prefix: String,
    pub timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "linkhub:".to_string(),
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    pub write_wait_seconds: u64,
    /// Read deadline; re-armed by every inbound frame including pongs
    pub pong_wait_seconds: u64,
    pub ping_period_seconds: u64,
    /// Capacity of each connection's outbound queue
    pub send_queue_size: usize,
    /// Application heartbeat timeout enforced by the sweep task
    pub heartbeat_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// How long a connection may stay anonymous after connecting; 0 disables
    pub anonymous_timeout_seconds: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 8 * 1024,
            write_wait_seconds: 10,
            pong_wait_seconds: 60,
            ping_period_seconds: 54,
            send_queue_size: 256,
            heartbeat_timeout_seconds: 90,
            sweep_interval_seconds: 30,
            anonymous_timeout_seconds: 30,
        }
    }
}

impl WebSocketConfig {
    #[must_use]
    pub const fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_seconds)
    }

    #[must_use]
    pub const fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_seconds)
    }

    #[must_use]
    pub const fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_seconds)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    #[must_use]
    pub const fn anonymous_timeout(&self) -> Option<Duration> {
        match self.anonymous_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// How often this instance refreshes its server heartbeat
    pub refresh_interval_seconds: u64,
    /// Server entries older than this are considered dead
    pub stale_after_seconds: u64,
    /// A user record is considered online while its heartbeat is younger than this
    pub user_online_timeout_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 60,
            stale_after_seconds: 180,
            user_online_timeout_seconds: 360,
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    #[must_use]
    pub const fn user_online_timeout(&self) -> Duration {
        Duration::from_secs(self.user_online_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HS256 secret of the identity service
    pub jwt_secret: String,
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    /// App ids accepted at login
    pub allowed: Vec<u32>,
    /// Substituted when a login carries app id 0
    pub default: u32,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            allowed: vec![101, 102, 103, 104],
            default: 101,
        }
    }
}

impl PlatformsConfig {
    /// Resolve a requested app id, `None` if it is not accepted
    #[must_use]
    pub fn resolve(&self, requested: u32) -> Option<u32> {
        let platform = if requested == 0 { self.default } else { requested };
        self.allowed.contains(&platform).then_some(platform)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second per connection and command (0 = unlimited)
    pub per_second: u32,
    /// Commands never throttled
    pub exempt: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            exempt: vec!["heartbeat".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LINKHUB_SERVER__PORT=9000, LINKHUB_REDIS__URL=redis://...
        builder = builder.add_source(
            Environment::with_prefix("LINKHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Listen address of the gateway
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check cross-field constraints, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let ws = &self.websocket;

        if ws.ping_period_seconds == 0 || ws.ping_period_seconds >= ws.pong_wait_seconds {
            errors.push(format!(
                "websocket.ping_period_seconds ({}) must be non-zero and below pong_wait_seconds ({})",
                ws.ping_period_seconds, ws.pong_wait_seconds
            ));
        }
        if ws.send_queue_size == 0 {
            errors.push("websocket.send_queue_size must be greater than 0".to_string());
        }
        if ws.max_message_size == 0 {
            errors.push("websocket.max_message_size must be greater than 0".to_string());
        }
        if ws.heartbeat_timeout_seconds == 0 || ws.sweep_interval_seconds == 0 {
            errors.push(
                "websocket.heartbeat_timeout_seconds and sweep_interval_seconds must be greater than 0"
                    .to_string(),
            );
        }
        if self.presence.refresh_interval_seconds == 0
            || self.presence.refresh_interval_seconds >= self.presence.stale_after_seconds
        {
            errors.push(format!(
                "presence.refresh_interval_seconds ({}) must be non-zero and below stale_after_seconds ({})",
                self.presence.refresh_interval_seconds, self.presence.stale_after_seconds
            ));
        }
        if !self.platforms.allowed.contains(&self.platforms.default) {
            errors.push(format!(
                "platforms.default ({}) is not in platforms.allowed",
                self.platforms.default
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            errors.push("auth.jwt_secret must be set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Resolve the config file and load it
///
/// Search order:
/// 1. explicit path (CLI)
/// 2. `LINKHUB_CONFIG_PATH` environment variable
/// 3. ./config.yaml
/// 4. environment variables only
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            anyhow::bail!("Config file not found: {path}");
        }
    }

    let config_path = explicit
        .map(str::to_string)
        .or_else(|| {
            std::env::var("LINKHUB_CONFIG_PATH")
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    Ok(config)
}
