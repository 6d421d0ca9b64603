//! Kubernetes API server.

use super::{flag, with_extra_args, PlaneContext};
use crate::auth::CertificateName;
use crate::cluster::HostSpec;
use crate::paths::{ca_cert_path, cert_path, key_path, API_PORT, CONFIG_DIR_BIND};
use crate::runtime::{ContainerSpec, PortBinding};

const ADMISSION_CONTROL: &str = "ServiceAccount,NamespaceLifecycle,LimitRanger,PersistentVolumeLabel,DefaultStorageClass,ResourceQuota,DefaultTolerationSeconds";

pub(super) fn build(host: &HostSpec, ctx: &PlaneContext<'_>) -> ContainerSpec {
    let service = &ctx.spec.services.kube_api;
    let serving = CertificateName::ApiServer(host.address.clone());
    let (cert, key) = (cert_path(&serving), key_path(&serving));

    let command = vec![
        "/hyperkube".to_string(),
        "apiserver".to_string(),
        flag("insecure-bind-address", "127.0.0.1"),
        flag("insecure-port", 8080),
        flag("secure-port", API_PORT),
        flag("bind-address", "0.0.0.0"),
        flag("cloud-provider", ""),
        flag("allow-privileged", true),
        flag("service-cluster-ip-range", ctx.network.service_range),
        flag("admission-control", ADMISSION_CONTROL),
        flag("runtime-config", "batch/v2alpha1"),
        flag("runtime-config", "authentication.k8s.io/v1beta1=true"),
        flag("storage-backend", "etcd3"),
        flag("etcd-servers", &ctx.etcd_servers),
        flag("etcd-cafile", ca_cert_path()),
        flag("etcd-certfile", &cert),
        flag("etcd-keyfile", &key),
        flag("advertise-address", &host.advertise_address),
        flag("client-ca-file", ca_cert_path()),
        flag("tls-cert-file", &cert),
        flag("tls-private-key-file", &key),
        flag(
            "service-account-key-file",
            key_path(&CertificateName::ServiceAccountToken),
        ),
    ];

    ContainerSpec::new("kube-api", &service.image, with_extra_args(command, &service.extra_args))
        .with_binds([CONFIG_DIR_BIND])
        .host_network()
        .publish(PortBinding::tcp(API_PORT))
}
