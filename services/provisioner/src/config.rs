//! Configuration for the provisioner.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::ConfigError;

/// Where the previous run's cluster state comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryStrategy {
    /// Read the state file written by the last successful run.
    #[default]
    Persisted,

    /// Ignore any prior state; every run is a fresh install.
    Fresh,
}

impl FromStr for DiscoveryStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persisted" => Ok(Self::Persisted),
            "fresh" => Ok(Self::Fresh),
            _ => Err(ConfigError::InvalidSetting {
                name: "FLEETKUBE_DISCOVERY",
                value: s.to_string(),
            }),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidSetting {
                name: "FLEETKUBE_LOG_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Explicit state file; derived from the cluster file when unset.
    pub state_file: Option<PathBuf>,

    pub discovery: DiscoveryStrategy,

    /// ssh client used to forward each host's Docker socket.
    pub ssh_binary: String,

    /// Directory holding the forwarded local sockets.
    pub tunnel_dir: PathBuf,

    /// How long to wait for a tunnel and the remote Docker daemon.
    pub dial_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            discovery: DiscoveryStrategy::Persisted,
            ssh_binary: "ssh".to_string(),
            tunnel_dir: std::env::temp_dir().join("fleetkube-tunnels"),
            dial_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let state_file = lookup("FLEETKUBE_STATE_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let discovery = match lookup("FLEETKUBE_DISCOVERY") {
            Some(value) => value.parse()?,
            None => defaults.discovery,
        };

        let ssh_binary = lookup("FLEETKUBE_SSH_BINARY").unwrap_or(defaults.ssh_binary);

        let tunnel_dir = lookup("FLEETKUBE_TUNNEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.tunnel_dir);

        let dial_timeout = match lookup("FLEETKUBE_DIAL_TIMEOUT_SECS") {
            Some(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
                    name: "FLEETKUBE_DIAL_TIMEOUT_SECS",
                    value: value.clone(),
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.dial_timeout,
        };

        let log_level = lookup("FLEETKUBE_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_format = match lookup("FLEETKUBE_LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => defaults.log_format,
        };

        Ok(Self {
            state_file,
            discovery,
            ssh_binary,
            tunnel_dir,
            dial_timeout,
            log_level,
            log_format,
        })
    }

    /// State file for a cluster file: the override, or `<stem>.state.yml` beside it.
    pub fn state_file_for(&self, cluster_file: &Path) -> PathBuf {
        if let Some(path) = &self.state_file {
            return path.clone();
        }
        let stem = cluster_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("cluster");
        cluster_file.with_file_name(format!("{}.state.yml", stem))
    }
}
