//! Kubelet.

use super::{flag, with_extra_args, PlaneContext};
use crate::auth::CertificateName;
use crate::cluster::HostSpec;
use crate::paths::{kubeconfig_path, CONFIG_DIR_BIND};
use crate::runtime::ContainerSpec;

const RUNTIME_BINDS: [&str; 10] = [
    "/etc/cni:/etc/cni:ro",
    "/opt/cni:/opt/cni:ro",
    "/etc/resolv.conf:/etc/resolv.conf",
    "/sys:/sys:ro",
    "/var/lib/docker:/var/lib/docker:rw",
    "/var/lib/kubelet:/var/lib/kubelet:shared",
    "/var/run:/var/run:rw",
    "/run:/run",
    "/sys/fs/cgroup:/sys/fs/cgroup:rw",
    "/dev:/host/dev",
];

pub(super) fn build(host: &HostSpec, ctx: &PlaneContext<'_>) -> ContainerSpec {
    let service = &ctx.spec.services.kubelet;
    let command = vec![
        "/hyperkube".to_string(),
        "kubelet".to_string(),
        flag("v", 2),
        flag("address", "0.0.0.0"),
        flag("cluster-domain", &service.cluster_domain),
        flag("pod-infra-container-image", &service.infra_container_image),
        flag("cgroup-driver", "cgroupfs"),
        flag("cgroups-per-qos", true),
        flag("enforce-node-allocatable", ""),
        flag("hostname-override", &host.hostname),
        flag("cluster-dns", ctx.network.dns_ip),
        flag("network-plugin", "cni"),
        flag("cni-conf-dir", "/etc/cni/net.d"),
        flag("cni-bin-dir", "/opt/cni/bin"),
        flag("resolv-conf", "/etc/resolv.conf"),
        flag("allow-privileged", true),
        flag("cloud-provider", ""),
        flag("kubeconfig", kubeconfig_path(&CertificateName::Node)),
        flag("require-kubeconfig", true),
    ];

    ContainerSpec::new("kubelet", &service.image, with_extra_args(command, &service.extra_args))
        .with_binds([CONFIG_DIR_BIND])
        .with_binds(RUNTIME_BINDS)
        .host_network()
        .host_pid()
        .privileged()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{cluster, context};

    #[test]
    fn test_kubelet_is_privileged_on_host_namespaces() {
        let spec = cluster();
        let kubelet = build(&spec.hosts[2], &context(&spec));

        assert!(kubelet.privileged);
        assert_eq!(kubelet.network_mode.as_deref(), Some("host"));
        assert_eq!(kubelet.pid_mode.as_deref(), Some("host"));
        assert_eq!(kubelet.binds[0], CONFIG_DIR_BIND);
        assert_eq!(kubelet.binds.len(), 1 + RUNTIME_BINDS.len());
        assert!(kubelet.command.contains(&"--hostname-override=node-3".to_string()));
        assert!(kubelet.command.contains(&"--cluster-dns=10.233.0.10".to_string()));
        assert!(kubelet.command.contains(&"--cluster-domain=cluster.local".to_string()));
    }
}
