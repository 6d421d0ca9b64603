//! Fixed locations on every host.
//!
//! The host preparer writes credentials here and the component containers
//! read them through the same bind mount, so both sides share these paths.

use crate::auth::CertificateName;

/// Configuration directory, bind-mounted into every component.
pub const CONFIG_DIR: &str = "/etc/kubernetes";

/// Certificates, keys and kubeconfigs.
pub const SSL_DIR: &str = "/etc/kubernetes/ssl";

/// Bind spec mounting the configuration directory at the same path.
pub const CONFIG_DIR_BIND: &str = "/etc/kubernetes:/etc/kubernetes";

/// Secure API server port.
pub const API_PORT: u16 = 6443;

pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;

/// `https://addr:port`, bracketing IPv6 literals.
pub fn https_url(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("https://[{}]:{}", address, port)
    } else {
        format!("https://{}:{}", address, port)
    }
}

pub fn cert_path(name: &CertificateName) -> String {
    format!("{}/{}.pem", SSL_DIR, name.file_stem())
}

pub fn key_path(name: &CertificateName) -> String {
    format!("{}/{}-key.pem", SSL_DIR, name.file_stem())
}

/// Kubeconfig path for a client certificate's component.
pub fn kubeconfig_path(name: &CertificateName) -> String {
    format!("{}/.kubeconfig-{}.yaml", SSL_DIR, name.file_stem())
}

pub fn ca_cert_path() -> String {
    cert_path(&CertificateName::Ca)
}
