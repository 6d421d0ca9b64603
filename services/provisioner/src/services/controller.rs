//! Kubernetes controller manager.

use super::{flag, with_extra_args, PlaneContext};
use crate::auth::CertificateName;
use crate::cluster::HostSpec;
use crate::paths::{ca_cert_path, key_path, kubeconfig_path, CONFIG_DIR_BIND};
use crate::runtime::ContainerSpec;

pub(super) fn build(_host: &HostSpec, ctx: &PlaneContext<'_>) -> ContainerSpec {
    let service = &ctx.spec.services.kube_controller;

    let command = vec![
        "/hyperkube".to_string(),
        "controller-manager".to_string(),
        flag("address", "0.0.0.0"),
        flag("cloud-provider", ""),
        flag("leader-elect", true),
        flag("kubeconfig", kubeconfig_path(&CertificateName::ControllerManager)),
        flag("enable-hostpath-provisioner", false),
        flag("node-monitor-grace-period", "40s"),
        flag("pod-eviction-timeout", "5m0s"),
        flag("v", 2),
        flag("allocate-node-cidrs", true),
        flag("cluster-cidr", ctx.network.cluster_cidr),
        flag("service-cluster-ip-range", ctx.network.service_range),
        flag(
            "service-account-private-key-file",
            key_path(&CertificateName::ServiceAccountToken),
        ),
        flag("root-ca-file", ca_cert_path()),
    ];

    // Host network so the 127.0.0.1 kubeconfig reaches the local API server.
    ContainerSpec::new(
        "kube-controller",
        &service.image,
        with_extra_args(command, &service.extra_args),
    )
    .with_binds([CONFIG_DIR_BIND])
    .host_network()
}
