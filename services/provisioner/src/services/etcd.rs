//! etcd member.

use super::{flag, with_extra_args, PlaneContext};
use crate::auth::CertificateName;
use crate::cluster::HostSpec;
use crate::paths::{
    ca_cert_path, cert_path, https_url, key_path, CONFIG_DIR_BIND, ETCD_CLIENT_PORT,
    ETCD_PEER_PORT,
};
use crate::runtime::ContainerSpec;

const DATA_DIR: &str = "/etcd-data";
const DATA_BIND: &str = "/var/lib/etcd:/etcd-data";
const CLUSTER_TOKEN: &str = "etcd-cluster-1";

/// Member name of `host` in the initial cluster list.
pub(super) fn member_name(host: &HostSpec) -> String {
    format!("etcd-{}", host.hostname)
}

pub(super) fn build(host: &HostSpec, ctx: &PlaneContext<'_>) -> ContainerSpec {
    let service = &ctx.spec.services.etcd;
    let name = CertificateName::Etcd(host.address.clone());
    let (cert, key, ca) = (cert_path(&name), key_path(&name), ca_cert_path());

    let command = vec![
        "/usr/local/bin/etcd".to_string(),
        flag("name", member_name(host)),
        flag("data-dir", DATA_DIR),
        flag("advertise-client-urls", https_url(&host.advertise_address, ETCD_CLIENT_PORT)),
        flag("listen-client-urls", https_url("0.0.0.0", ETCD_CLIENT_PORT)),
        flag("initial-advertise-peer-urls", https_url(&host.advertise_address, ETCD_PEER_PORT)),
        flag("listen-peer-urls", https_url("0.0.0.0", ETCD_PEER_PORT)),
        flag("initial-cluster-token", CLUSTER_TOKEN),
        flag("initial-cluster", &ctx.etcd_initial_cluster),
        flag("initial-cluster-state", "new"),
        flag("client-cert-auth", true),
        flag("trusted-ca-file", &ca),
        flag("cert-file", &cert),
        flag("key-file", &key),
        flag("peer-client-cert-auth", true),
        flag("peer-trusted-ca-file", &ca),
        flag("peer-cert-file", &cert),
        flag("peer-key-file", &key),
    ];

    ContainerSpec::new("etcd", &service.image, with_extra_args(command, &service.extra_args))
        .with_binds([DATA_BIND, CONFIG_DIR_BIND])
        .host_network()
}
