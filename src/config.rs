use crate::protocol::is_valid_domain;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Below this timeout/heartbeat ratio one or two lost datagrams are enough
/// to flap a peer offline.
const RECOMMENDED_TIMEOUT_RATIO: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("offlineTimeoutSec ({timeout}s) must be greater than heartbeatIntervalSec ({interval}s)")]
    TimeoutTooShort { timeout: u64, interval: u64 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("multicastAddr {0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),
    #[error("domainSuffix must not be empty")]
    EmptySuffix,
    #[error("domainSuffix {0:?} is not a valid hostname suffix")]
    InvalidSuffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Human chosen name; empty means derive one from the hardware.
    pub device_name: String,
    pub domain_suffix: String,
    pub multicast_addr: Ipv4Addr,
    pub multicast_port: u16,
    pub heartbeat_interval_sec: u64,
    pub offline_timeout_sec: u64,
    pub offline_check_interval_sec: u64,
    pub log_level: String,
    pub hosts_path: PathBuf,
    /// Overrides the hardware derived device id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            domain_suffix: "coobee.local".to_string(),
            multicast_addr: Ipv4Addr::new(239, 255, 0, 1),
            multicast_port: 9527,
            heartbeat_interval_sec: 10,
            offline_timeout_sec: 30,
            offline_check_interval_sec: 5,
            log_level: "info".to_string(),
            hosts_path: default_hosts_path(),
            device_id: None,
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, json + "\n").map_err(write_err)
    }

    /// Reject settings the discovery protocol cannot work with; warn about
    /// ones it merely works badly with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_sec == 0 {
            return Err(ConfigError::ZeroInterval("heartbeatIntervalSec"));
        }
        if self.offline_check_interval_sec == 0 {
            return Err(ConfigError::ZeroInterval("offlineCheckIntervalSec"));
        }
        if self.offline_timeout_sec <= self.heartbeat_interval_sec {
            return Err(ConfigError::TimeoutTooShort {
                timeout: self.offline_timeout_sec,
                interval: self.heartbeat_interval_sec,
            });
        }
        if !self.multicast_addr.is_multicast() {
            return Err(ConfigError::NotMulticast(self.multicast_addr));
        }
        let suffix = self.domain_suffix.trim_matches('.');
        if suffix.is_empty() {
            return Err(ConfigError::EmptySuffix);
        }
        if !is_valid_domain(suffix) {
            return Err(ConfigError::InvalidSuffix(self.domain_suffix.clone()));
        }

        if self.offline_timeout_sec < RECOMMENDED_TIMEOUT_RATIO * self.heartbeat_interval_sec {
            tracing::warn!(
                offline_timeout_sec = self.offline_timeout_sec,
                heartbeat_interval_sec = self.heartbeat_interval_sec,
                "offline timeout is less than {}x the heartbeat interval; peers may flap offline",
                RECOMMENDED_TIMEOUT_RATIO
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_sec)
    }

    pub fn offline_check_interval(&self) -> Duration {
        Duration::from_secs(self.offline_check_interval_sec)
    }
}

/// `"My Laptop"` + `"coobee.local"` gives `"my-laptop.coobee.local"`.
///
/// Anything but ASCII letters and digits in the name becomes `-`, so the
/// result is always a hostname peers accept.
pub fn generate_domain(device_name: &str, suffix: &str) -> String {
    let label: String = device_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let label = match label.trim_matches('-') {
        "" => "node",
        label => label,
    };
    format!("{}.{}", label, suffix.trim_matches('.'))
}

pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}
