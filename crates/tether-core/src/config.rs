//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthError, ServiceParams};
use crate::identity::{IdentityError, PeerIdentity};
use crate::wire::DEFAULT_MAX_PAYLOAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub session: SessionSettings,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Device identity shown to peers and used for arbitration.
    /// Empty = derive from $HOSTNAME.
    pub name: String,
}

/// Link lifecycle and health-check tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Links still connecting after this long are discarded.
    pub connect_timeout_ms: u64,
    /// Ready links silent for longer than this are discarded.
    pub liveness_timeout_ms: u64,
    /// Health tick period: ping, evict, re-dial, recompute.
    pub health_check_interval_ms: u64,
    /// How long a link reporting "waiting for connectivity" is kept.
    /// 0 = terminate immediately.
    pub waiting_grace_ms: u64,
    /// Largest accepted frame payload.
    pub max_payload_bytes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service name; only peers advertising the same name are discovered.
    pub service_name: String,
    /// Pre-shared secret. Peers with a different secret cannot connect.
    pub auth_secret: String,
    /// Network interface for link-local multicast. Empty = first CLI argument.
    pub interface: String,
    /// TCP port accepting links. 0 = OS-assigned.
    pub session_port: u16,
    /// Announcement period.
    pub announce_interval_ms: u64,
    /// Peers not heard from within this window are dropped from discovery.
    pub peer_ttl_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            liveness_timeout_ms: 8_000,
            health_check_interval_ms: 2_000,
            waiting_grace_ms: 0,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_name: "tether".to_string(),
            auth_secret: String::new(),
            interface: String::new(),
            session_port: 0,
            announce_interval_ms: 1_000,
            peer_ttl_ms: 5_000,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn waiting_grace(&self) -> Duration {
        Duration::from_millis(self.waiting_grace_ms)
    }

    /// Reject settings under which the health loop cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval_ms must be non-zero".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be non-zero".into()));
        }
        // A ready link is pinged once per interval; a liveness timeout at or
        // below the interval would evict healthy links between pings.
        if self.liveness_timeout_ms <= self.health_check_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness_timeout_ms ({}) must exceed health_check_interval_ms ({})",
                self.liveness_timeout_ms, self.health_check_interval_ms
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes must be non-zero".into()));
        }
        Ok(())
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    /// Reject timings the announcement and expiry loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval_ms == 0 {
            return Err(ConfigError::Invalid("announce_interval_ms must be non-zero".into()));
        }
        // A peer must be able to miss an announcement without expiring.
        if self.peer_ttl_ms <= self.announce_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "peer_ttl_ms ({}) must exceed announce_interval_ms ({})",
                self.peer_ttl_ms, self.announce_interval_ms
            )));
        }
        Ok(())
    }

    pub fn service_params(&self) -> Result<ServiceParams, ConfigError> {
        ServiceParams::new(&self.service_name, &self.auth_secret).map_err(ConfigError::Service)
    }
}

impl TetherConfig {
    /// Resolve the configured identity, falling back to the host name.
    pub fn peer_identity(&self) -> Result<PeerIdentity, ConfigError> {
        let name = if self.identity.name.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_default()
        } else {
            self.identity.name.clone()
        };
        PeerIdentity::new(name).map_err(ConfigError::Identity)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
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
    #[error("invalid identity: {0}")]
    Identity(IdentityError),
    #[error("invalid service: {0}")]
    Service(AuthError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
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
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__SERVICE_NAME") {
            self.discovery.service_name = v;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__AUTH_SECRET") {
            self.discovery.auth_secret = v;
        }
        if let Some(v) = lookup("TETHER_DISCOVERY__INTERFACE") {
            self.discovery.interface = v;
        }
        if let Some(p) = lookup("TETHER_DISCOVERY__SESSION_PORT").and_then(|v| v.parse().ok()) {
            self.discovery.session_port = p;
        }
        let millis = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
        if let Some(ms) = millis("TETHER_DISCOVERY__ANNOUNCE_INTERVAL_MS") {
            self.discovery.announce_interval_ms = ms;
        }
        if let Some(ms) = millis("TETHER_DISCOVERY__PEER_TTL_MS") {
            self.discovery.peer_ttl_ms = ms;
        }
        if let Some(ms) = millis("TETHER_SESSION__CONNECT_TIMEOUT_MS") {
            self.session.connect_timeout_ms = ms;
        }
        if let Some(ms) = millis("TETHER_SESSION__LIVENESS_TIMEOUT_MS") {
            self.session.liveness_timeout_ms = ms;
        }
        if let Some(ms) = millis("TETHER_SESSION__HEALTH_CHECK_INTERVAL_MS") {
            self.session.health_check_interval_ms = ms;
        }
        if let Some(ms) = millis("TETHER_SESSION__WAITING_GRACE_MS") {
            self.session.waiting_grace_ms = ms;
        }
        if let Some(n) = lookup("TETHER_SESSION__MAX_PAYLOAD_BYTES").and_then(|v| v.parse().ok()) {
            self.session.max_payload_bytes = n;
        }
    }
}
