//! Cluster description: hosts, their roles and the per-component settings.
//!
//! A [`ClusterSpec`] is the parsed and validated form of `cluster.yml`.
//! Values are only ever produced by [`ClusterSpec::parse`] or
//! [`ClusterSpec::load`], so the rest of the provisioner can rely on every
//! host having an address, an advertise address and a hostname, and on every
//! component having an image.

mod loader;
mod network;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use loader::ConfigError;
pub use network::ClusterNetwork;

/// Responsibility a host takes on in the cluster.
///
/// Ordering follows the deploy phases: etcd, then control plane, then workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Etcd,
    #[serde(rename = "controlplane")]
    ControlPlane,
    Worker,
}

impl Role {
    /// Roles in deploy order.
    pub const PHASES: [Role; 3] = [Role::Etcd, Role::ControlPlane, Role::Worker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Etcd => "etcd",
            Role::ControlPlane => "controlplane",
            Role::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

/// A machine in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// IP address used for SSH and for peer traffic.
    pub address: String,

    /// Node name. Defaults to the address.
    #[serde(default)]
    pub hostname: String,

    /// Address other components reach this host at. Defaults to the address.
    #[serde(default)]
    pub advertise_address: String,

    /// SSH login user.
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key passed to ssh with `-i`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,

    /// Docker Engine socket on the remote host.
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,

    #[serde(default, alias = "role")]
    pub roles: BTreeSet<Role>,
}

impl HostSpec {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Extra `--key=value` flags appended to a component's command line.
pub type ExtraArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdService {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

fn default_service_cluster_ip_range() -> String {
    "10.233.0.0/18".to_string()
}

fn default_cluster_cidr() -> String {
    "10.233.64.0/18".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_infra_container_image() -> String {
    "gcr.io/google_containers/pause-amd64:3.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeApiService {
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_service_cluster_ip_range")]
    pub service_cluster_ip_range: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeControllerService {
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_cluster_cidr")]
    pub cluster_cidr: String,
    #[serde(default = "default_service_cluster_ip_range")]
    pub service_cluster_ip_range: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerService {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletService {
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
    #[serde(default = "default_infra_container_image")]
    pub infra_container_image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeproxyService {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: ExtraArgs,
}

/// Per-component settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services {
    pub etcd: EtcdService,
    #[serde(rename = "kube-api")]
    pub kube_api: KubeApiService,
    #[serde(rename = "kube-controller")]
    pub kube_controller: KubeControllerService,
    pub scheduler: SchedulerService,
    pub kubelet: KubeletService,
    pub kubeproxy: KubeproxyService,
}

fn default_auth_strategy() -> String {
    "x509".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationSpec {
    #[serde(default = "default_auth_strategy")]
    pub strategy: String,
}

impl Default for AuthenticationSpec {
    fn default() -> Self {
        Self {
            strategy: default_auth_strategy(),
        }
    }
}

fn default_cert_deployer_image() -> String {
    "busybox:1.36".to_string()
}

/// Images for helper containers the provisioner runs itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemImages {
    #[serde(default = "default_cert_deployer_image")]
    pub cert_deployer: String,
}

impl Default for SystemImages {
    fn default() -> Self {
        Self {
            cert_deployer: default_cert_deployer_image(),
        }
    }
}

/// The full desired cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub hosts: Vec<HostSpec>,
    pub services: Services,
    #[serde(default)]
    pub authentication: AuthenticationSpec,
    #[serde(default)]
    pub system_images: SystemImages,
}

impl ClusterSpec {
    /// Hosts carrying `role`, in declaration order.
    pub fn hosts_with_role(&self, role: Role) -> impl Iterator<Item = &HostSpec> + '_ {
        self.hosts.iter().filter(move |h| h.has_role(role))
    }

    /// The first declared control-plane host; its address is the API endpoint.
    pub fn first_control_plane(&self) -> Option<&HostSpec> {
        self.hosts_with_role(Role::ControlPlane).next()
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
