//! Parsing, enrichment and validation of the cluster document.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fleetkube_networking::parse_host_address;
use thiserror::Error;
use tracing::debug;

use super::{ClusterNetwork, ClusterSpec, Role};

/// The cluster document or the provisioner settings are unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read cluster file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cluster document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid cluster specification: {0}")]
    Invalid(String),

    #[error("host {host}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("service {service}: {reason}")]
    InvalidService {
        service: &'static str,
        reason: String,
    },

    #[error("unsupported authentication strategy {0:?} (supported: x509)")]
    UnsupportedAuth(String),

    #[error("persisted state {path} is unusable: {reason}")]
    InvalidState { path: PathBuf, reason: String },

    #[error("invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },
}

impl ClusterSpec {
    /// Read and validate a cluster document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = Self::parse(&document)?;
        debug!(path = %path.display(), hosts = spec.hosts.len(), "Loaded cluster file");
        Ok(spec)
    }

    /// Parse, enrich and validate a cluster document.
    pub fn parse(document: &str) -> Result<Self, ConfigError> {
        let mut spec: ClusterSpec = serde_yaml::from_str(document)?;
        spec.enrich();
        spec.validate()?;
        Ok(spec)
    }

    /// Fill computed defaults that depend on other fields.
    fn enrich(&mut self) {
        for host in &mut self.hosts {
            host.address = host.address.trim().to_string();
            if host.advertise_address.trim().is_empty() {
                host.advertise_address = host.address.clone();
            }
            if host.hostname.trim().is_empty() {
                host.hostname = host.address.clone();
            }
        }
    }

    /// Check every structural rule a deployable cluster must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("no hosts declared".to_string()));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            let invalid = |reason: String| ConfigError::InvalidHost {
                host: host.address.clone(),
                reason,
            };

            if host.address.is_empty() {
                return Err(ConfigError::Invalid(
                    "host entry without an address".to_string(),
                ));
            }
            parse_host_address(&host.address).map_err(|e| invalid(e.to_string()))?;
            parse_host_address(&host.advertise_address)
                .map_err(|e| invalid(format!("advertise address: {}", e)))?;
            if !seen.insert(host.address.as_str()) {
                return Err(invalid("address declared more than once".to_string()));
            }
            if host.roles.is_empty() {
                return Err(invalid("no roles assigned".to_string()));
            }
            if host.user.trim().is_empty() {
                return Err(invalid("empty SSH user".to_string()));
            }
        }

        if self.hosts_with_role(Role::Etcd).next().is_none() {
            return Err(ConfigError::Invalid("no host has the etcd role".to_string()));
        }
        if self.first_control_plane().is_none() {
            return Err(ConfigError::Invalid(
                "no host has the controlplane role".to_string(),
            ));
        }

        let services = &self.services;
        let images = [
            ("etcd", &services.etcd.image),
            ("kube-api", &services.kube_api.image),
            ("kube-controller", &services.kube_controller.image),
            ("scheduler", &services.scheduler.image),
            ("kubelet", &services.kubelet.image),
            ("kubeproxy", &services.kubeproxy.image),
        ];
        for (service, image) in images {
            if image.trim().is_empty() {
                return Err(ConfigError::InvalidService {
                    service,
                    reason: "no image".to_string(),
                });
            }
        }
        if self.system_images.cert_deployer.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "system_images.cert_deployer is empty".to_string(),
            ));
        }
        if services.kubelet.cluster_domain.trim().is_empty() {
            return Err(ConfigError::InvalidService {
                service: "kubelet",
                reason: "empty cluster_domain".to_string(),
            });
        }

        ClusterNetwork::from_spec(self)?;
        Ok(())
    }
}
