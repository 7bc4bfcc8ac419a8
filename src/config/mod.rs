//! Configuration Module
//!
//! Provides TOML-based configuration for Notibus with support for:
//! - Server settings (bind addresses, WebSocket path)
//! - Connection and frame limits
//! - Delivery tuning (queue capacity, overflow policy, drain timeout)
//! - Metrics endpoint
//! - Environment variable overrides (NOTIBUS_* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export metrics config types
pub use metrics::MetricsConfig;

mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Delivery configuration
    pub delivery: DeliveryConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket path (default: "/ws")
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:7311".parse().unwrap()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_bind: None,
            ws_path: default_ws_path(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of connections (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum frame size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Maximum subscriptions per connection (0 = unlimited)
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_max_frame_size() -> usize {
    64 * 1024
}
fn default_max_subscriptions() -> usize {
    1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_subscriptions_per_connection: default_max_subscriptions(),
        }
    }
}

/// Overflow policy for a full outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Reject the incoming frame, keep what is queued
    #[default]
    RejectNewest,
    /// Evict the oldest queued frame to make room
    DropOldest,
}

/// Delivery configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-connection outbound queue capacity.
    /// This buffer holds frames waiting to be written to the client
    /// socket. Higher values absorb larger bursts but use more memory
    /// per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What happens when the queue is full: "reject-newest" drops the
    /// incoming frame, "drop-oldest" evicts the oldest queued one.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// How long a closing connection may spend flushing its queue
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

fn default_queue_capacity() -> usize {
    256
}
fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `NOTIBUS__` prefix with double underscores for nesting:
    ///    - `NOTIBUS__SERVER__BIND=0.0.0.0:7312` overrides `server.bind`
    ///    - `NOTIBUS__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `NOTIBUS__DELIVERY__QUEUE_CAPACITY=1024` overrides `delivery.queue_capacity`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:7311")?
            .set_default("server.ws_path", "/ws")?
            .set_default("limits.max_connections", 10_000)?
            .set_default("limits.max_frame_size", 64 * 1024)?
            .set_default("limits.max_subscriptions_per_connection", 1024)?
            .set_default("delivery.queue_capacity", 256)?
            .set_default("delivery.overflow", "reject-newest")?
            .set_default("delivery.drain_timeout", "5s")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (NOTIBUS__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("NOTIBUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "delivery.queue_capacity must be at least 1".to_string(),
            ));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            )));
        }

        if let Some(ws_bind) = self.server.ws_bind {
            if ws_bind == self.server.bind {
                return Err(ConfigError::Validation(
                    "server.ws_bind must differ from server.bind".to_string(),
                ));
            }
        }

        // Note: 0 means unlimited for connection and subscription limits

        Ok(())
    }
}
