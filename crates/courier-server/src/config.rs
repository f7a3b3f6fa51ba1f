//! Server configuration, read from TOML with environment fallbacks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
///
/// Every section is optional in TOML; missing keys take their defaults, and
/// `COURIER_HOST`, `COURIER_PORT`, `COURIER_DB_PATH` and `COURIER_JWT_SECRET`
/// override the built-in defaults (but not values set in a file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub heartbeat: HeartbeatConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Route of the WebSocket endpoint.
    pub websocket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Open sockets, authenticated or not.
    pub max_connections: usize,
    pub max_rooms: usize,
    pub max_rooms_per_connection: usize,
    /// Largest inbound WebSocket message, in bytes.
    pub max_message_size: usize,
}

/// Heartbeat timings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between server pings.
    pub interval_ms: u64,
    /// Silence after which a connection is dropped.
    pub timeout_ms: u64,
    /// Time allowed between upgrade and the `connect` event.
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Port of the Prometheus exporter.
    pub port: u16,
}

/// Which backend holds the offline queues and presence records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process memory. Lost on restart, not shared between processes.
    Memory,
    /// The SQLite database file.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `~` is expanded.
    pub db_path: String,
    pub store_backend: StoreBackend,
    /// Seconds between purges of expired queue and presence entries.
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret used to verify `connect` tokens.
    pub jwt_secret: Option<String>,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: env("COURIER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env("COURIER_PORT").and_then(|p| p.parse().ok()).unwrap_or(8080),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_rooms: 100_000,
            max_rooms_per_connection: 256,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 60_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: env("COURIER_JWT_SECRET"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: env("COURIER_DB_PATH").unwrap_or_else(|| "courier.db".to_string()),
            store_backend: StoreBackend::Sqlite,
            purge_interval_secs: 60,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl StorageConfig {
    /// Database path with `~` expanded.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).as_ref())
    }

    #[must_use]
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

const SEARCH_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

impl Config {
    /// Load configuration from the `--config` argument, the default search
    /// paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// `--config` names a missing file.
    pub fn load() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--config" {
                let path = args.next().context("--config requires a path")?;
                return Self::from_file(shellexpand::tilde(&path).as_ref());
            }
        }

        SEARCH_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
            .map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
