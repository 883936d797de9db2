//! Configuration system for Trellis.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::peer::PeerId;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub bootstrap: BootstrapConfig,
    pub discovery: DiscoveryConfig,
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Names this instance. Selects the default store path and, in
    /// networked mode, the advertised host.
    pub instance_name: String,
    /// Peer store location. None = `<data_dir>/peer-db-<instance_name>.db`.
    pub store_path: Option<PathBuf>,
}

/// How this instance is reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Single host. Listen on loopback, advertise addresses unchanged.
    #[default]
    Local,
    /// Multi-host (containers, one per instance). Listen on all
    /// interfaces and advertise `/dns4/<instance_name>` instead of ip4 hosts.
    Networked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Peer id of the rendezvous peer. None disables bootstrap exchange.
    pub target: Option<String>,
    /// Shared location the rendezvous peer publishes its addresses to.
    pub board_path: PathBuf,
    /// How often the rendezvous peer republishes.
    pub publish_interval_secs: u64,
    /// Delay between board reads while the rendezvous peer is not up yet.
    pub poll_interval_secs: u64,
    /// Board reads per bootstrap cycle.
    pub max_poll_attempts: u32,
    /// How often a joiner repeats bootstrap while the target is not connected.
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub dht_interval_secs: u64,
    pub gossip_interval_secs: u64,
    /// DHT announcements older than this are ignored.
    pub announce_ttl_secs: u64,
    /// Backoff schedule for polling the substrate address book after connect.
    pub address_retry_delays_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub persist_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// Records not seen within this window are pruned unless connected.
    pub retention_secs: u64,
    /// Records older than this are pruned even if connected.
    pub max_age_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_name: "default".to_string(),
            store_path: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Local,
            port: 0,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            target: None,
            board_path: data_dir().join("bootstrap.json"),
            publish_interval_secs: 10,
            poll_interval_secs: 2,
            max_poll_attempts: 5,
            retry_interval_secs: 30,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dht_interval_secs: 30,
            gossip_interval_secs: 15,
            announce_ttl_secs: 600,
            address_retry_delays_ms: vec![1_000, 2_000, 5_000],
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            persist_interval_secs: 10,
            prune_interval_secs: 30,
            stats_interval_secs: 60,
            retention_secs: 5 * 60,
            max_age_secs: 60 * 60,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Resolved peer store path.
    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            data_dir().join(format!("peer-db-{}.db", self.instance_name))
        })
    }
}

impl NetworkConfig {
    /// Listen address for this instance.
    pub fn listen_address(&self) -> String {
        match self.mode {
            NetworkMode::Local => format!("/ip4/127.0.0.1/tcp/{}", self.port),
            NetworkMode::Networked => format!("/ip4/0.0.0.0/tcp/{}", self.port),
        }
    }

    /// Rewrite a listen address into the form other instances can dial.
    ///
    /// Only networked mode rewrites, and only loopback/unspecified ip4 hosts.
    pub fn advertised(&self, address: &str, instance_name: &str) -> String {
        if self.mode != NetworkMode::Networked {
            return address.to_string();
        }
        for host in ["/ip4/127.0.0.1/", "/ip4/0.0.0.0/"] {
            if let Some(rest) = address.strip_prefix(host) {
                return format!("/dns4/{instance_name}/{rest}");
            }
        }
        address.to_string()
    }
}

impl BootstrapConfig {
    pub fn target_peer(&self) -> Option<PeerId> {
        self.target
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(PeerId::from)
    }
}

impl DiscoveryConfig {
    pub fn address_retry_delays(&self) -> Vec<Duration> {
        self.address_retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl ReconciliationConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trellis")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("trellis")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TrellisConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TrellisConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TrellisConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TRELLIS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TRELLIS_NODE__INSTANCE_NAME") {
            self.node.instance_name = v;
        }
        if let Some(v) = var("TRELLIS_NODE__STORE_PATH") {
            self.node.store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("TRELLIS_NETWORK__MODE") {
            match v.as_str() {
                "local" => self.network.mode = NetworkMode::Local,
                "networked" => self.network.mode = NetworkMode::Networked,
                _ => {}
            }
        }
        if let Some(v) = var("TRELLIS_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = var("TRELLIS_BOOTSTRAP__TARGET") {
            self.bootstrap.target = Some(v);
        }
    }
}
