//! Configuration for the teamserver.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line flags are applied on top by the binary.
//!
//! Config file location:
//!   1. $TEAMSERVER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/teamserver/config.toml
//!   3. ~/.config/teamserver/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::curve::StaticKeypair;
use crate::crypto::CipherSuite;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamServerConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// WebSocket and status API port. 0 = OS-assigned.
    pub port: u16,
    /// How long a new connection may take to send its key_exchange.
    pub handshake_timeout_secs: u64,
    /// Idle time after which the sweeper expires a session.
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub health_interval_secs: u64,
    /// Consecutive undecryptable frames before the connection is dropped.
    pub max_auth_failures: u32,
    /// Per-session queue of encrypted frames waiting for the socket.
    pub outbound_queue: usize,
    pub cipher_suite: CipherSuite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    /// Remote subscribers connect here. 0 = OS-assigned.
    pub pub_port: u16,
    /// Remote publishers connect here. 0 = OS-assigned.
    pub sub_port: u16,
    /// Noise-secured links. Turning this off is logged as a warning.
    pub secure: bool,
    /// Hex X25519 private key. Empty = generate one at startup.
    pub secret_key: String,
    /// How long an accepted bus link may take to finish its handshake.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log. Unset = audit records are discarded.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a bearer token on the WebSocket upgrade.
    pub required: bool,
    pub tokens: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            handshake_timeout_secs: 10,
            session_timeout_secs: 1800,
            sweep_interval_secs: 60,
            health_interval_secs: 5,
            max_auth_failures: 5,
            outbound_queue: 256,
            cipher_suite: CipherSuite::Aes256Gcm,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            pub_port: 5555,
            sub_port: 5556,
            secure: true,
            secret_key: String::new(),
            handshake_timeout_secs: 10,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl BusConfig {
    pub fn pub_addr(&self) -> String {
        format!("{}:{}", self.host, self.pub_port)
    }

    pub fn sub_addr(&self) -> String {
        format!("{}:{}", self.host, self.sub_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// The configured static keypair, or `None` if one should be generated.
    pub fn keypair(&self) -> Result<Option<StaticKeypair>, ConfigError> {
        if self.secret_key.trim().is_empty() {
            return Ok(None);
        }
        StaticKeypair::from_hex(&self.secret_key)
            .map(Some)
            .map_err(|_| ConfigError::InvalidKey("bus.secret_key"))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("teamserver")
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
    #[error("{0} is not a valid 32-byte hex key")]
    InvalidKey(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TeamServerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides. A missing
    /// file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            TeamServerConfig::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TEAMSERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    pub fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&TeamServerConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::InvalidValue(
                "server.outbound_queue",
                "must be at least 1".into(),
            ));
        }
        if self.server.max_auth_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "server.max_auth_failures",
                "must be at least 1".into(),
            ));
        }
        if self.auth.required && self.auth.tokens.is_empty() {
            return Err(ConfigError::InvalidValue(
                "auth.tokens",
                "auth.required is set but no tokens are configured".into(),
            ));
        }
        self.bus.keypair()?;
        Ok(())
    }

    /// Apply TEAMSERVER_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("TEAMSERVER_SERVER__HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("TEAMSERVER_SERVER__PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("TEAMSERVER_SERVER__CIPHER_SUITE") {
            self.server.cipher_suite = CipherSuite::from_name(&v)
                .ok_or(ConfigError::InvalidValue("server.cipher_suite", v))?;
        }
        if let Ok(v) = std::env::var("TEAMSERVER_BUS__SECURE") {
            self.bus.secure = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TEAMSERVER_BUS__SECRET_KEY") {
            self.bus.secret_key = v;
        }
        if let Ok(v) = std::env::var("TEAMSERVER_BUS__PUB_PORT") {
            if let Ok(p) = v.parse() {
                self.bus.pub_port = p;
            }
        }
        if let Ok(v) = std::env::var("TEAMSERVER_BUS__SUB_PORT") {
            if let Ok(p) = v.parse() {
                self.bus.sub_port = p;
            }
        }
        if let Ok(v) = std::env::var("TEAMSERVER_AUDIT__PATH") {
            self.audit.path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Everything on loopback with OS-assigned ports and a one-second
    /// health check. Used by tests and embedded deployments.
    pub fn ephemeral() -> Self {
        let mut config = Self::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.server.health_interval_secs = 1;
        config.bus.pub_port = 0;
        config.bus.sub_port = 0;
        config
    }
}
