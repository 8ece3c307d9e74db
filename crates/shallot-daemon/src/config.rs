//! Configuration file management.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shallot_types::{PortLayout, BASE_ONION_ROUTER_PORT, BASE_USER_PORT, CIRCUIT_HOPS, REGISTRY_PORT};
use shallot_transport::quic::{QuicFabric, DEFAULT_IDLE_TIMEOUT_MS};

use crate::events::EventFilter;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Ports and sockets.
    #[serde(default)]
    pub network: NetworkConfig,
    /// What to start.
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,
    /// Router `n` listens on `relay_base_port + n`.
    #[serde(default = "default_relay_base_port")]
    pub relay_base_port: u16,
    /// User `n` listens on `user_base_port + n`.
    #[serde(default = "default_user_base_port")]
    pub user_base_port: u16,
    /// Every service binds here, and every address resolves here.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// QUIC idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u32,
}

/// Which services to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Number of onion routers, ids `0..relays`.
    #[serde(default = "default_relays")]
    pub relays: u32,
    /// Number of user agents, ids `0..users`.
    #[serde(default = "default_users")]
    pub users: u32,
    /// Hops per circuit.
    #[serde(default = "default_circuit_length")]
    pub circuit_length: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Event categories mirrored into the log ("relay", "user", "system").
    /// Absent means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_categories: Option<Vec<String>>,
}

// Default value functions

fn default_registry_port() -> u16 {
    REGISTRY_PORT
}

fn default_relay_base_port() -> u16 {
    BASE_ONION_ROUTER_PORT
}

fn default_user_base_port() -> u16 {
    BASE_USER_PORT
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_idle_timeout_ms() -> u32 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_relays() -> u32 {
    10
}

fn default_users() -> u32 {
    2
}

fn default_circuit_length() -> usize {
    CIRCUIT_HOPS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            registry_port: default_registry_port(),
            relay_base_port: default_relay_base_port(),
            user_base_port: default_user_base_port(),
            bind_host: default_bind_host(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            users: default_users(),
            circuit_length: default_circuit_length(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            event_categories: None,
        }
    }
}

impl NetworkConfig {
    /// Port layout for address derivation.
    pub fn layout(&self) -> PortLayout {
        PortLayout {
            registry: self.registry_port,
            relay_base: self.relay_base_port,
            user_base: self.user_base_port,
        }
    }

    /// QUIC fabric on the configured host.
    pub fn fabric(&self) -> anyhow::Result<QuicFabric> {
        let host: IpAddr = self
            .bind_host
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind_host {:?}: {e}", self.bind_host))?;
        Ok(QuicFabric {
            host,
            idle_timeout_ms: self.idle_timeout_ms,
        })
    }
}

impl LoggingConfig {
    /// Filter for the events the binary mirrors into the log.
    pub fn event_filter(&self) -> EventFilter {
        EventFilter {
            categories: self.event_categories.clone(),
            node_ids: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration.
    ///
    /// `$SHALLOT_CONFIG` names a file that must exist. Otherwise the data
    /// directory's `config.toml` is read, with defaults if it does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(std::env::var_os("SHALLOT_CONFIG").map(PathBuf::from))
    }

    /// Load from an explicit path, or from the data directory when `None`.
    pub fn load_from(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            return Self::from_toml(&content);
        }
        let config_path = Self::data_dir().join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading config {}", config_path.display()))?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no network can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.launch.circuit_length == 0 {
            anyhow::bail!("launch.circuit_length must be at least 1");
        }
        let layout = self.network.layout();
        let relay_end = u64::from(layout.relay_base) + u64::from(self.launch.relays);
        let user_end = u64::from(layout.user_base) + u64::from(self.launch.users);
        if relay_end > u64::from(u16::MAX) + 1 || user_end > u64::from(u16::MAX) + 1 {
            anyhow::bail!("relay or user ports run past 65535");
        }
        self.network.fabric()?;
        Ok(())
    }

    /// Data directory, `$SHALLOT_DATA_DIR` or `~/.shallot`.
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("SHALLOT_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".shallot"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/shallot"))
    }
}
