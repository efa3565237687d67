//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub pki: PkiConfig,
    pub listen: ListenConfig,
    pub tun: TunConfig,
    /// Virtual address → real `ip:port` candidates.
    pub static_host_map: BTreeMap<String, Vec<String>>,
    pub firewall: FirewallConfig,
    pub timers: TimersConfig,
    pub handshakes: HandshakesConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Hex Ed25519 verifying key of the trusted CA.
    pub ca: PathBuf,
    /// This node's certificate.
    pub cert: PathBuf,
    /// Hex X25519 private key matching the certificate.
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Number of UDP receive tasks.
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    /// Run without a virtual interface (packets are only routed, never delivered).
    pub disabled: bool,
    pub dev: String,
    pub mtu: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub outbound: Vec<RuleConfig>,
    pub inbound: Vec<RuleConfig>,
    pub conntrack: ConntrackConfig,
}

/// One firewall rule as written in the config file. Parsed into a typed
/// rule when the engine builds its rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// `any`, `tcp`, `udp` or `icmp`.
    #[serde(default = "any")]
    pub proto: String,
    /// `any`, a port number, or a `lo-hi` range.
    #[serde(default = "any_port")]
    pub port: PortValue,
    /// `any`, an address, or a CIDR.
    #[serde(default = "any")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    pub tcp_timeout_secs: u64,
    pub udp_timeout_secs: u64,
    pub default_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Seconds of silence before a keepalive probe is sent.
    pub connection_alive_interval: u64,
    /// Further seconds without an answer before the host is removed.
    pub pending_deletion_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakesConfig {
    pub try_interval_ms: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Loopback port for the control API. 0 disables it.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is unset.
    pub level: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn any() -> String {
    "any".to_string()
}

fn any_port() -> PortValue {
    PortValue::Text(any())
}

impl RuleConfig {
    pub fn any() -> Self {
        Self {
            proto: any(),
            port: any_port(),
            host: any(),
        }
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            pki: PkiConfig::default(),
            listen: ListenConfig::default(),
            tun: TunConfig::default(),
            static_host_map: BTreeMap::new(),
            firewall: FirewallConfig::default(),
            timers: TimersConfig::default(),
            handshakes: HandshakesConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PkiConfig {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            ca: dir.join("ca.pub"),
            cert: dir.join("host.crt"),
            key: dir.join("host.key"),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4242,
            workers: 2,
        }
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            dev: "tether1".to_string(),
            mtu: 1300,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            outbound: vec![RuleConfig::any()],
            inbound: vec![RuleConfig {
                proto: "icmp".to_string(),
                ..RuleConfig::any()
            }],
            conntrack: ConntrackConfig::default(),
        }
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: 720,
            udp_timeout_secs: 180,
            default_timeout_secs: 600,
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            connection_alive_interval: 5,
            pending_deletion_interval: 10,
        }
    }
}

impl Default for HandshakesConfig {
    fn default() -> Self {
        Self {
            try_interval_ms: 100,
            retries: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 4243 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
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
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
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

    /// Reject settings the engine can't run with. Firewall rule syntax is
    /// checked separately when the rule set is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timers.connection_alive_interval == 0 {
            return Err(ConfigError::Invalid(
                "timers.connection_alive_interval",
                "must be a positive number of seconds".into(),
            ));
        }
        if self.timers.pending_deletion_interval == 0 {
            return Err(ConfigError::Invalid(
                "timers.pending_deletion_interval",
                "must be a positive number of seconds".into(),
            ));
        }
        if self.handshakes.retries == 0 {
            return Err(ConfigError::Invalid(
                "handshakes.retries",
                "must be at least 1".into(),
            ));
        }
        if self.handshakes.try_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshakes.try_interval_ms",
                "must be positive".into(),
            ));
        }
        if self.listen.workers == 0 {
            return Err(ConfigError::Invalid(
                "listen.workers",
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_secs(self.timers.connection_alive_interval)
    }

    pub fn pending_deletion_interval(&self) -> Duration {
        Duration::from_secs(self.timers.pending_deletion_interval)
    }

    pub fn handshake_try_interval(&self) -> Duration {
        Duration::from_millis(self.handshakes.try_interval_ms)
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TETHER_LISTEN__PORT") {
            if let Ok(p) = v.parse() {
                self.listen.port = p;
            }
        }
        if let Ok(v) = std::env::var("TETHER_LOGGING__LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("TETHER_TUN__DISABLED") {
            self.tun.disabled = v == "true" || v == "1";
        }
    }
}
