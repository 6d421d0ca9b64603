//! Container specs for every cluster component.
//!
//! Each builder is a pure function of the cluster spec, the host it runs on
//! and the resolved network. Identical inputs always produce identical
//! specs, which is what lets the deployer detect "nothing changed".

mod controller;
mod etcd;
mod kubeapi;
mod kubelet;
mod kubeproxy;
mod scheduler;

use crate::cluster::{ClusterNetwork, ClusterSpec, ConfigError, ExtraArgs, HostSpec, Role};
use crate::paths::{https_url, API_PORT, ETCD_CLIENT_PORT, ETCD_PEER_PORT};
use crate::runtime::ContainerSpec;

/// A deployable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Etcd,
    KubeApi,
    KubeController,
    Scheduler,
    Kubelet,
    KubeProxy,
}

impl Component {
    /// Container name on the host; also the idempotence key.
    pub fn container_name(&self) -> &'static str {
        match self {
            Component::Etcd => "etcd",
            Component::KubeApi => "kube-api",
            Component::KubeController => "kube-controller",
            Component::Scheduler => "scheduler",
            Component::Kubelet => "kubelet",
            Component::KubeProxy => "kube-proxy",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Component::Etcd => Role::Etcd,
            Component::KubeApi | Component::KubeController | Component::Scheduler => {
                Role::ControlPlane
            }
            Component::Kubelet | Component::KubeProxy => Role::Worker,
        }
    }

    /// Components of a phase in deploy order.
    pub fn for_role(role: Role) -> &'static [Component] {
        match role {
            Role::Etcd => &[Component::Etcd],
            Role::ControlPlane => &[
                Component::KubeApi,
                Component::KubeController,
                Component::Scheduler,
            ],
            Role::Worker => &[Component::Kubelet, Component::KubeProxy],
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.container_name())
    }
}

/// Cluster-wide values shared by every builder.
#[derive(Debug, Clone)]
pub struct PlaneContext<'a> {
    pub spec: &'a ClusterSpec,
    pub network: ClusterNetwork,
    /// `https://<ip>:2379` of every etcd host, comma-joined in host order.
    pub etcd_servers: String,
    /// `<name>=https://<ip>:2380` of every etcd host.
    pub etcd_initial_cluster: String,
    /// API server of the first control-plane host.
    pub api_server_url: String,
}

impl<'a> PlaneContext<'a> {
    pub fn new(spec: &'a ClusterSpec, network: ClusterNetwork) -> Result<Self, ConfigError> {
        let first = spec
            .first_control_plane()
            .ok_or_else(|| ConfigError::Invalid("no host has the controlplane role".to_string()))?;

        let etcd_hosts: Vec<&HostSpec> = spec.hosts_with_role(Role::Etcd).collect();
        let etcd_servers = etcd_hosts
            .iter()
            .map(|h| https_url(&h.address, ETCD_CLIENT_PORT))
            .collect::<Vec<_>>()
            .join(",");
        let etcd_initial_cluster = etcd_hosts
            .iter()
            .map(|h| {
                format!(
                    "{}={}",
                    etcd::member_name(h),
                    https_url(&h.advertise_address, ETCD_PEER_PORT)
                )
            })
            .collect::<Vec<_>>()
            .join(",");

        Ok(Self {
            spec,
            network,
            etcd_servers,
            etcd_initial_cluster,
            api_server_url: https_url(&first.address, API_PORT),
        })
    }
}

/// Build the container spec for `component` on `host`.
pub fn build_container_spec(
    component: Component,
    host: &HostSpec,
    ctx: &PlaneContext<'_>,
) -> ContainerSpec {
    match component {
        Component::Etcd => etcd::build(host, ctx),
        Component::KubeApi => kubeapi::build(host, ctx),
        Component::KubeController => controller::build(host, ctx),
        Component::Scheduler => scheduler::build(host, ctx),
        Component::Kubelet => kubelet::build(host, ctx),
        Component::KubeProxy => kubeproxy::build(host, ctx),
    }
}

/// `--flag=value` for every extra arg, in key order.
fn with_extra_args(mut command: Vec<String>, extra: &ExtraArgs) -> Vec<String> {
    command.extend(extra.iter().map(|(k, v)| {
        let flag = k.trim_start_matches('-');
        format!("--{}={}", flag, v)
    }));
    command
}

fn flag(name: &str, value: impl std::fmt::Display) -> String {
    format!("--{}={}", name, value)
}
