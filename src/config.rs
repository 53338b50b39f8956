//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (SUBWIRE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [http]
//! host = "0.0.0.0"
//! port = 8080
//! path = "/trpc"
//!
//! [session]
//! idle_timeout_ms = 120000
//! context_failure_grace_ms = 1000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SUBWIRE_HTTP__PORT=9000
//! SUBWIRE_SESSION__HEARTBEAT_INTERVAL_MS=0
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path. Empty = stderr.
    #[serde(default)]
    pub file: String,
}

/// HTTP server configuration for the WebSocket endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP server bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Route the WebSocket upgrade is served on (no trailing slash)
    #[serde(default = "default_http_path")]
    pub path: String,

    /// Allowed CORS origins (empty = same-origin only, unless cors_allow_all is true)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Explicitly allow all CORS origins (dev mode opt-in)
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Maximum inbound WebSocket message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum concurrent HTTP connections. 0 = unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

/// Per-connection session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delay between sending a context-resolution failure and closing the
    /// socket. Must be long enough for the error frame to reach the peer.
    #[serde(default = "default_context_failure_grace_ms")]
    pub context_failure_grace_ms: u64,

    /// Close connections with no inbound traffic for this long. 0 = disabled.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Server-initiated ping interval. 0 = disabled.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Maximum connection lifetime in seconds. 0 = unlimited.
    #[serde(default)]
    pub max_lifetime_secs: u64,

    /// Maximum number of calls in one batch frame. 0 = unlimited.
    #[serde(default)]
    pub max_batch_size: usize,

    /// Queued outbound frames above which broadcasts skip a session
    #[serde(default = "default_max_backpressure")]
    pub max_backpressure: usize,

    /// Close sessions whose backlog exceeds `max_backpressure`, on any send,
    /// instead of only skipping them for broadcasts
    #[serde(default)]
    pub close_on_backpressure_limit: bool,

    /// Send a reconnect notification to every session on graceful shutdown
    #[serde(default = "default_true")]
    pub broadcast_reconnect_on_shutdown: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    crate::protocol::DEFAULT_PORT
}
fn default_http_path() -> String {
    "/trpc".to_string()
}
fn default_max_message_size() -> usize {
    crate::protocol::MAX_MESSAGE_SIZE
}
fn default_context_failure_grace_ms() -> u64 {
    1_000
}
fn default_idle_timeout_ms() -> u64 {
    120_000 // 2 minutes
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_max_backpressure() -> usize {
    1024
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (SUBWIRE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("SUBWIRE_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SUBWIRE_").split("__"))
            .extract()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: String::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_http_host(),
            port: default_http_port(),
            path: default_http_path(),
            cors_origins: Vec::new(),
            cors_allow_all: false,
            max_message_size: default_max_message_size(),
            max_connections: 0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            context_failure_grace_ms: default_context_failure_grace_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_lifetime_secs: 0,
            max_batch_size: 0,
            max_backpressure: default_max_backpressure(),
            close_on_backpressure_limit: false,
            broadcast_reconnect_on_shutdown: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert!(config.logging.file.is_empty());
    }

    #[test]
    fn test_default_http_config() {
        let config = Config::default();
        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.path, "/trpc");
        assert!(config.http.cors_origins.is_empty());
        assert_eq!(config.http.max_connections, 0);
    }

    #[test]
    fn test_default_session_config() {
        let session = SessionConfig::default();
        assert_eq!(session.context_failure_grace_ms, 1_000);
        assert_eq!(session.idle_timeout_ms, 120_000);
        assert_eq!(session.heartbeat_interval_ms, 30_000);
        assert_eq!(session.max_backpressure, 1024);
        assert!(!session.close_on_backpressure_limit);
        assert!(session.broadcast_reconnect_on_shutdown);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("[http]"));
        assert!(toml_str.contains("[session]"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.http.port, 8080);
        assert_eq!(back.http.path, "/trpc");
        assert_eq!(back.session.context_failure_grace_ms, 1_000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let back: Config = toml::from_str("[http]\nport = 9001\n").unwrap();
        assert_eq!(back.http.port, 9001);
        assert_eq!(back.http.host, "127.0.0.1");
        assert_eq!(back.session.idle_timeout_ms, 120_000);
        assert_eq!(back.logging.level, "info");
    }
}
