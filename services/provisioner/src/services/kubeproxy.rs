//! kube-proxy.

use super::{flag, with_extra_args, PlaneContext};
use crate::auth::CertificateName;
use crate::cluster::HostSpec;
use crate::paths::{kubeconfig_path, CONFIG_DIR_BIND};
use crate::runtime::ContainerSpec;

pub(super) fn build(_host: &HostSpec, ctx: &PlaneContext<'_>) -> ContainerSpec {
    let service = &ctx.spec.services.kubeproxy;
    let command = vec![
        "/hyperkube".to_string(),
        "proxy".to_string(),
        flag("v", 2),
        flag("healthz-bind-address", "0.0.0.0"),
        flag("kubeconfig", kubeconfig_path(&CertificateName::Proxy)),
    ];

    ContainerSpec::new("kube-proxy", &service.image, with_extra_args(command, &service.extra_args))
        .with_binds([CONFIG_DIR_BIND])
        .host_network()
        .privileged()
}
