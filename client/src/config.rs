//! Node configuration: defaults, optional TOML file, environment overrides
//!
//! File example:
//!
//! ```toml
//! bind = "0.0.0.0:50999"
//! display_name = "Alice"
//! ack_timeout_ms = 2000
//! auto_accept_files = true
//! download_dir = "./downloads"
//! ```
//!
//! Env overrides: `LSNP_BIND`, `LSNP_SERVER`, `LSNP_DOWNLOAD_DIR`.

use crate::reliable::RetryPolicy;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Local socket address
    pub bind: SocketAddr,
    /// Ip used in this node's `id@ip` identity; the bind ip when unset
    pub advertise_ip: Option<IpAddr>,
    pub display_name: Option<String>,
    pub status: String,
    /// Rendezvous server; peer-to-peer broadcast mode when unset
    pub server: Option<SocketAddr>,
    pub broadcast_addr: SocketAddr,
    pub presence_interval_secs: u64,
    /// HEARTBEAT period in relay mode
    pub heartbeat_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub ack_timeout_ms: u64,
    pub max_attempts: u32,
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Pause between FILE_OFFER and the first chunk
    pub offer_lead_ms: u64,
    pub file_inactivity_secs: u64,
    pub file_retention_secs: u64,
    pub token_ttl_secs: u64,
    pub auto_accept_files: bool,
    pub download_dir: Option<PathBuf>,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], shared::DEFAULT_PORT)),
            advertise_ip: None,
            display_name: None,
            status: "Exploring LSNP!".to_string(),
            server: None,
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], shared::DEFAULT_PORT)),
            presence_interval_secs: shared::PING_TTL,
            heartbeat_interval_secs: 5,
            liveness_timeout_secs: shared::PING_TTL * 2,
            sweep_interval_secs: 5,
            ack_timeout_ms: 2000,
            max_attempts: 3,
            chunk_size: shared::DEFAULT_CHUNK_SIZE,
            max_file_size: 16 * 1024 * 1024,
            offer_lead_ms: 1000,
            file_inactivity_secs: 60,
            file_retention_secs: 300,
            token_ttl_secs: shared::DEFAULT_TOKEN_TTL,
            auto_accept_files: false,
            download_dir: None,
            max_peers: 4096,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Defaults, then the file at `path` when given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("LSNP_BIND") {
            self.bind = parse_env("LSNP_BIND", &value)?;
        }
        if let Ok(value) = std::env::var("LSNP_SERVER") {
            self.server = Some(parse_env("LSNP_SERVER", &value)?);
        }
        if let Ok(value) = std::env::var("LSNP_DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Ip placed in this node's identity
    pub fn identity_ip(&self) -> IpAddr {
        self.advertise_ip.unwrap_or_else(|| self.bind.ip())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn offer_lead(&self) -> Duration {
        Duration::from_millis(self.offer_lead_ms)
    }

    pub fn file_inactivity(&self) -> Duration {
        Duration::from_secs(self.file_inactivity_secs)
    }

    pub fn file_retention(&self) -> Duration {
        Duration::from_secs(self.file_retention_secs)
    }

    /// Config suited to tests and loopback demos: ephemeral port, short timers
    pub fn loopback() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            broadcast_addr: SocketAddr::from(([127, 0, 0, 1], shared::DEFAULT_PORT)),
            presence_interval_secs: 60,
            ack_timeout_ms: 200,
            offer_lead_ms: 0,
            ..Self::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
