//! Server configuration.
//!
//! Configuration can be loaded from:
//! - The file named by `TALKROOM_CONFIG`
//! - A TOML file in one of the default locations
//! - Environment variables (`TALKROOM_HOST`, `TALKROOM_PORT`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use talkroom_core::{HubConfig, InMemoryDirectory};
use talkroom_protocol::{RoomId, UserId, UserProfile};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application name reported by the health endpoint.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Deployment environment.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,

    /// Users and rooms loaded into the in-memory directory.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix for the WebSocket endpoint; the credential follows it.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    Plain,
    /// One JSON object per line.
    #[default]
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

/// Seed data for the in-memory directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Users and their credentials.
    #[serde(default)]
    pub users: Vec<SeedUser>,

    /// Rooms and their members.
    #[serde(default)]
    pub rooms: Vec<SeedRoom>,
}

/// A seeded user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Credential presented on the WebSocket path.
    pub credential: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A seeded room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRoom {
    pub id: i64,
    #[serde(default)]
    pub members: Vec<i64>,
}

// Default value functions
fn default_app_name() -> String {
    "talkroom".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_host() -> String {
    std::env::var("TALKROOM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TALKROOM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws/talkroom".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            outbound_queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if `TALKROOM_CONFIG` names a file that cannot be read.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("TALKROOM_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "talkroom.toml",
            "/etc/talkroom/talkroom.toml",
            "~/.config/talkroom/talkroom.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Environment variables win over values read from a file.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TALKROOM_HOST") {
            self.host = host;
        }
        if let Some(port) = std::env::var("TALKROOM_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = port;
        }
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Route for the WebSocket endpoint, with the credential path segment.
    #[must_use]
    pub fn websocket_route(&self) -> String {
        format!(
            "{}/:credential",
            self.transport.websocket_path.trim_end_matches('/')
        )
    }

    /// Build the hub configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.limits.max_connections,
            max_frame_size: self.limits.max_frame_size,
            outbound_queue_capacity: self.limits.outbound_queue_capacity,
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            idle_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
        }
    }

    /// Build an in-memory directory from the seed section.
    #[must_use]
    pub fn seed_directory(&self) -> InMemoryDirectory {
        let directory = InMemoryDirectory::new();

        for user in &self.seed.users {
            let id = UserId(user.id);
            directory.add_user(UserProfile {
                id,
                username: user.username.clone(),
                full_name: user.full_name.clone(),
                avatar_url: user.avatar_url.clone(),
            });
            directory.set_active(id, user.active);
            directory.issue_credential(user.credential.clone(), id, None);
        }

        for room in &self.seed.rooms {
            for member in &room.members {
                directory.add_member(RoomId(room.id), UserId(*member));
            }
        }

        directory
    }
}
