//! Container runtime interface and implementations.
//!
//! The provisioner drives each host through a small container lifecycle
//! capability: inspect, create-and-start, start, remove and wait. Two
//! implementations exist:
//! - `docker`: Docker Engine API over a Unix socket forwarded with `ssh -L`
//! - `mock`: an in-memory fleet for tests and dry runs
//!
//! Runtimes never decide whether a container should change. That decision is
//! made by the deployer from [`ContainerSpec::spec_hash`].

pub mod docker;
pub mod mock;
pub mod ssh;

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetkube_reconcile::{Lifecycle, SpecHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::HostSpec;

pub use docker::DockerRuntime;
pub use mock::{MockFleet, MockOp, MockOpKind, MockRuntime};
pub use ssh::{SshDialer, SshTunnel};

/// Label carrying the hash of the spec a container was created from.
pub const SPEC_HASH_LABEL: &str = "io.fleetkube.spec-hash";

/// Errors from a host's container runtime or the channel to it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Docker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container {name} exited with status {code}")]
    Exited { name: String, code: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    No,
    Always,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
        }
    }
}

/// A host port published for a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortBinding {
    pub fn tcp(port: u16) -> Self {
        Self {
            container_port: port,
            protocol: "tcp".to_string(),
            host_ip: "0.0.0.0".to_string(),
            host_port: port,
        }
    }

    /// Docker's `<port>/<proto>` key.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub pid_mode: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    /// Metadata only; not part of the spec hash.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// A long-running container with restart policy `always`.
    pub fn new(name: impl Into<String>, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command,
            env: Vec::new(),
            binds: Vec::new(),
            network_mode: None,
            pid_mode: None,
            privileged: false,
            restart_policy: RestartPolicy::Always,
            port_bindings: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_binds<I, S>(mut self, binds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.binds.extend(binds.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    pub fn host_network(mut self) -> Self {
        self.network_mode = Some("host".to_string());
        self
    }

    pub fn host_pid(mut self) -> Self {
        self.pid_mode = Some("host".to_string());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn publish(mut self, binding: PortBinding) -> Self {
        self.port_bindings.push(binding);
        self
    }

    pub fn run_once(mut self) -> Self {
        self.restart_policy = RestartPolicy::No;
        self
    }

    /// Hash over every field that affects the running process.
    pub fn spec_hash(&self) -> SpecHash {
        let json = serde_json::json!({
            "name": self.name,
            "image": self.image,
            "command": self.command,
            "env": self.env,
            "binds": self.binds,
            "network_mode": self.network_mode,
            "pid_mode": self.pid_mode,
            "privileged": self.privileged,
            "restart_policy": self.restart_policy.as_str(),
            "port_bindings": self.port_bindings.iter().map(|p| serde_json::json!({
                "port": p.port_key(),
                "host_ip": p.host_ip,
                "host_port": p.host_port,
            })).collect::<Vec<_>>(),
        });
        SpecHash::from_json(&json)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.restart_policy {
            RestartPolicy::No => Lifecycle::OneShot,
            RestartPolicy::Always => Lifecycle::Service,
        }
    }
}

/// What a runtime reports for an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

impl ContainerState {
    /// The hash recorded at creation time, or one recomputed from the
    /// reconstructed spec for containers created by other tools.
    pub fn recorded_hash(&self) -> SpecHash {
        self.spec
            .labels
            .get(SPEC_HASH_LABEL)
            .and_then(|label| SpecHash::parse(label))
            .unwrap_or_else(|| self.spec.spec_hash())
    }
}

/// Container lifecycle operations scoped to one host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a container by name. `None` if absent.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// Create a container from `spec` and start it, returning its ID.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start an existing, stopped container.
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container. Removing an absent container succeeds.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, name: &str) -> Result<i64, RuntimeError>;

    /// Release the channel to the host.
    async fn close(&self) -> Result<(), RuntimeError>;
}

/// Opens a [`ContainerRuntime`] for a host.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &HostSpec) -> Result<Box<dyn ContainerRuntime>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::new("kube-api", "kube-apiserver:v1.28.2", vec!["kube-apiserver".into()])
            .host_network()
            .publish(PortBinding::tcp(6443))
    }

    #[test]
    fn test_labels_do_not_affect_hash() {
        let mut labelled = spec();
        labelled
            .labels
            .insert(SPEC_HASH_LABEL.to_string(), "sha256:x".to_string());
        assert_eq!(spec().spec_hash(), labelled.spec_hash());
    }

    #[test]
    fn test_image_change_changes_hash() {
        let mut changed = spec();
        changed.image = "kube-apiserver:v1.28.3".to_string();
        assert_ne!(spec().spec_hash(), changed.spec_hash());
    }

    #[test]
    fn test_recorded_hash_prefers_label() {
        let desired = spec();
        let mut observed = spec();
        observed.image = "something-else".to_string();
        observed.labels.insert(
            SPEC_HASH_LABEL.to_string(),
            desired.spec_hash().to_string(),
        );
        let state = ContainerState {
            id: "abc".to_string(),
            spec: observed,
            running: true,
        };
        assert_eq!(state.recorded_hash(), desired.spec_hash());
    }

    #[test]
    fn test_lifecycle_follows_restart_policy() {
        assert_eq!(spec().lifecycle(), Lifecycle::Service);
        assert_eq!(spec().run_once().lifecycle(), Lifecycle::OneShot);
    }
}
