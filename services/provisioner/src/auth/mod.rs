//! Authentication provisioning.
//!
//! Computes the certificates a cluster needs from its spec and produces a
//! [`CertificateBundle`] through a [`PkiService`]. When the previous run's
//! bundle is available its CA is kept, and leaves whose subject and SANs are
//! unchanged are carried over, so re-running against an unchanged cluster
//! issues nothing new.

pub mod bundle;

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

use fleetkube_pki::{
    inspect_certificate, validate_private_key, verify_signed_by, CertificateAuthority,
    LeafRequest, LeafUsage, PkiError, Subject, SubjectName,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::cluster::{ClusterNetwork, ClusterSpec, ConfigError, HostSpec, Role};

pub use bundle::{BundleError, CertificateBundle, CertificateKeyPair, CertificateName};

/// Common name of the cluster CA.
pub const CA_COMMON_NAME: &str = "kube-ca";

/// Leaves expiring sooner than this are re-issued instead of reused.
const RENEW_BEFORE_SECS: i64 = 30 * 24 * 60 * 60;

/// Supported authentication modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Mutual TLS with certificates from a cluster CA.
    X509,
}

impl FromStr for AuthType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x509" => Ok(Self::X509),
            _ => Err(ConfigError::UnsupportedAuth(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("cannot render kubeconfig: {0}")]
    Kubeconfig(#[from] serde_yaml::Error),

    #[error("certificate generation task failed: {0}")]
    Task(String),
}

/// One certificate the cluster needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub name: CertificateName,
    pub leaf: LeafRequest,
}

impl CertificateRequest {
    fn client(name: CertificateName, subject: Subject) -> Self {
        Self {
            name,
            leaf: LeafRequest {
                subject,
                usage: LeafUsage::Client,
                alt_names: BTreeSet::new(),
            },
        }
    }

    fn server(name: CertificateName, common_name: &str, alt_names: BTreeSet<SubjectName>) -> Self {
        Self {
            name,
            leaf: LeafRequest {
                subject: Subject::new(common_name),
                usage: LeafUsage::ServerAndClient,
                alt_names,
            },
        }
    }
}

/// Names every server certificate on `host` must carry.
fn host_alt_names(host: &HostSpec) -> BTreeSet<SubjectName> {
    [
        SubjectName::from_host(&host.address),
        SubjectName::from_host(&host.advertise_address),
        SubjectName::from_host(&host.hostname),
        SubjectName::Dns("localhost".to_string()),
        SubjectName::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ]
    .into_iter()
    .collect()
}

/// The full leaf set for a cluster. The CA itself is not included.
pub fn required_certificates(
    spec: &ClusterSpec,
    network: &ClusterNetwork,
) -> Vec<CertificateRequest> {
    let mut requests = vec![
        CertificateRequest::client(
            CertificateName::Admin,
            Subject::new("kube-admin").with_organization("system:masters"),
        ),
        CertificateRequest::client(
            CertificateName::ControllerManager,
            Subject::new("system:kube-controller-manager"),
        ),
        CertificateRequest::client(
            CertificateName::Scheduler,
            Subject::new("system:kube-scheduler"),
        ),
        CertificateRequest::client(
            CertificateName::Node,
            Subject::new("system:node").with_organization("system:nodes"),
        ),
        CertificateRequest::client(CertificateName::Proxy, Subject::new("system:kube-proxy")),
        CertificateRequest::client(
            CertificateName::ServiceAccountToken,
            Subject::new("kube-service-account-token"),
        ),
    ];

    let domain = &spec.services.kubelet.cluster_domain;
    for host in spec.hosts_with_role(Role::ControlPlane) {
        let mut alt_names = host_alt_names(host);
        alt_names.insert(SubjectName::Ip(IpAddr::V4(network.kubernetes_service_ip)));
        for name in [
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            format!("kubernetes.default.svc.{}", domain),
        ] {
            alt_names.insert(SubjectName::Dns(name));
        }
        requests.push(CertificateRequest::server(
            CertificateName::ApiServer(host.address.clone()),
            "kube-apiserver",
            alt_names,
        ));
    }

    for host in spec.hosts_with_role(Role::Etcd) {
        requests.push(CertificateRequest::server(
            CertificateName::Etcd(host.address.clone()),
            "kube-etcd",
            host_alt_names(host),
        ));
    }

    requests
}

/// Produces a bundle covering `desired`, reusing what it can from `existing`.
pub trait PkiService: Send + Sync {
    fn generate_or_reuse(
        &self,
        desired: &[CertificateRequest],
        existing: Option<&CertificateBundle>,
    ) -> Result<CertificateBundle, AuthError>;
}

/// X.509 PKI backed by `fleetkube-pki`.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Pki;

impl X509Pki {
    fn reusable_ca(existing: &CertificateBundle) -> Option<CertificateAuthority> {
        let ca = existing.ca();
        let info = inspect_certificate(&ca.certificate).ok()?;
        if !info.is_ca || info.subject.common_name != CA_COMMON_NAME {
            return None;
        }
        if !Self::fresh_enough(info.not_after) {
            info!("Cluster CA is close to expiry; replacing it");
            return None;
        }
        CertificateAuthority::from_pem(&ca.certificate, &ca.key).ok()
    }

    fn fresh_enough(not_after: i64) -> bool {
        not_after > chrono::Utc::now().timestamp() + RENEW_BEFORE_SECS
    }

    fn leaf_reusable(pair: &CertificateKeyPair, request: &LeafRequest, ca_pem: &str) -> bool {
        let Ok(info) = inspect_certificate(&pair.certificate) else {
            return false;
        };
        !info.is_ca
            && Self::fresh_enough(info.not_after)
            && info.subject == request.subject
            && info.alt_names == request.alt_names
            && verify_signed_by(&pair.certificate, ca_pem).unwrap_or(false)
            && validate_private_key(&pair.key).is_ok()
    }
}

impl PkiService for X509Pki {
    fn generate_or_reuse(
        &self,
        desired: &[CertificateRequest],
        existing: Option<&CertificateBundle>,
    ) -> Result<CertificateBundle, AuthError> {
        let reused = existing.and_then(|bundle| Self::reusable_ca(bundle).map(|ca| (ca, bundle)));

        let (ca, previous) = match reused {
            Some((ca, bundle)) => {
                info!("Reusing cluster CA");
                (ca, Some(bundle))
            }
            None => {
                info!("Generating cluster CA");
                (CertificateAuthority::new(CA_COMMON_NAME)?, None)
            }
        };

        let mut entries = BTreeMap::new();
        entries.insert(
            CertificateName::Ca,
            CertificateKeyPair {
                certificate: ca.ca_cert_pem().to_string(),
                key: ca.ca_key_pem().to_string(),
            },
        );

        let mut issued = 0usize;
        for request in desired {
            let carried = previous
                .and_then(|bundle| bundle.get(&request.name))
                .filter(|pair| Self::leaf_reusable(pair, &request.leaf, ca.ca_cert_pem()));

            let pair = match carried {
                Some(pair) => {
                    debug!(certificate = %request.name, "Reusing certificate");
                    pair.clone()
                }
                None => {
                    info!(certificate = %request.name, "Issuing certificate");
                    issued += 1;
                    let leaf = ca.issue(&request.leaf)?;
                    CertificateKeyPair {
                        certificate: leaf.cert_pem,
                        key: leaf.key_pem,
                    }
                }
            };
            entries.insert(request.name.clone(), pair);
        }

        info!(
            certificates = entries.len(),
            issued = issued,
            "Certificate bundle ready"
        );
        Ok(CertificateBundle::new(entries)?)
    }
}

/// Produce the bundle for this run.
///
/// Certificate generation is CPU-bound and runs on the blocking pool.
pub async fn provision(
    spec: &ClusterSpec,
    network: &ClusterNetwork,
    existing: Option<&CertificateBundle>,
    auth: AuthType,
    pki: Arc<dyn PkiService>,
) -> Result<CertificateBundle, AuthError> {
    match auth {
        AuthType::X509 => {
            let desired = required_certificates(spec, network);
            let existing = existing.cloned();
            tokio::task::spawn_blocking(move || pki.generate_or_reuse(&desired, existing.as_ref()))
                .await
                .map_err(|e| AuthError::Task(e.to_string()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CONTROL_PLANES: &str = r#"
hosts:
  - address: 10.0.0.5
    hostname: node-1
    roles: [etcd, controlplane, worker]
  - address: 10.0.0.6
    hostname: node-2
    advertise_address: 192.168.1.6
    roles: [controlplane]
services:
  etcd: { image: etcd }
  kube-api: { image: api }
  kube-controller: { image: controller }
  scheduler: { image: scheduler }
  kubelet: { image: kubelet }
  kubeproxy: { image: proxy }
"#;

    fn setup() -> (ClusterSpec, ClusterNetwork) {
        let spec = ClusterSpec::parse(TWO_CONTROL_PLANES).unwrap();
        let network = ClusterNetwork::from_spec(&spec).unwrap();
        (spec, network)
    }

    fn ip(s: &str) -> SubjectName {
        SubjectName::Ip(s.parse().unwrap())
    }

    fn dns(s: &str) -> SubjectName {
        SubjectName::Dns(s.to_string())
    }

    #[test]
    fn test_auth_type_parsing() {
        assert_eq!("x509".parse::<AuthType>().unwrap(), AuthType::X509);
        assert_eq!("X509".parse::<AuthType>().unwrap(), AuthType::X509);
        assert!(matches!(
            "ldap".parse::<AuthType>(),
            Err(ConfigError::UnsupportedAuth(_))
        ));
    }

    #[test]
    fn test_required_certificates() {
        let (spec, network) = setup();
        let requests = required_certificates(&spec, &network);
        let names: Vec<String> = requests.iter().map(|r| r.name.to_string()).collect();

        assert_eq!(
            names,
            [
                "kube-admin",
                "kube-controller-manager",
                "kube-scheduler",
                "kube-node",
                "kube-proxy",
                "kube-service-account-token",
                "kube-apiserver@10.0.0.5",
                "kube-apiserver@10.0.0.6",
                "kube-etcd@10.0.0.5",
            ]
        );
    }

    #[test]
    fn test_api_server_sans() {
        let (spec, network) = setup();
        let requests = required_certificates(&spec, &network);
        let api = requests
            .iter()
            .find(|r| r.name == CertificateName::ApiServer("10.0.0.6".to_string()))
            .unwrap();

        let sans = &api.leaf.alt_names;
        for expected in [
            ip("10.0.0.6"),
            ip("192.168.1.6"),
            dns("node-2"),
            dns("localhost"),
            ip("127.0.0.1"),
            ip("10.233.0.1"),
            dns("kubernetes"),
            dns("kubernetes.default"),
            dns("kubernetes.default.svc"),
            dns("kubernetes.default.svc.cluster.local"),
        ] {
            assert!(sans.contains(&expected), "missing SAN {}", expected);
        }
        assert_eq!(api.leaf.usage, LeafUsage::ServerAndClient);
    }

    #[test]
    fn test_fresh_bundle_is_signed_by_its_ca() {
        let (spec, network) = setup();
        let desired = required_certificates(&spec, &network);
        let bundle = X509Pki.generate_or_reuse(&desired, None).unwrap();

        assert_eq!(bundle.len(), desired.len() + 1);
        for (name, pair) in bundle.iter() {
            if !name.is_ca() {
                assert!(verify_signed_by(&pair.certificate, &bundle.ca().certificate).unwrap());
            }
        }

        let admin = inspect_certificate(&bundle.admin().certificate).unwrap();
        assert_eq!(admin.subject.organization.as_deref(), Some("system:masters"));
    }

    #[test]
    fn test_unchanged_cluster_reuses_everything() {
        let (spec, network) = setup();
        let desired = required_certificates(&spec, &network);
        let first = X509Pki.generate_or_reuse(&desired, None).unwrap();
        let second = X509Pki.generate_or_reuse(&desired, Some(&first)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_changed_host_reissues_only_its_leaf() {
        let (spec, network) = setup();
        let first = X509Pki
            .generate_or_reuse(&required_certificates(&spec, &network), None)
            .unwrap();

        let mut changed = spec.clone();
        changed.hosts[1].hostname = "node-2.example.com".to_string();
        let second = X509Pki
            .generate_or_reuse(&required_certificates(&changed, &network), Some(&first))
            .unwrap();

        assert_eq!(first.ca(), second.ca());
        assert_eq!(first.admin(), second.admin());
        let moved = CertificateName::ApiServer("10.0.0.6".to_string());
        let kept = CertificateName::ApiServer("10.0.0.5".to_string());
        assert_ne!(first.get(&moved), second.get(&moved));
        assert_eq!(first.get(&kept), second.get(&kept));
    }

    #[test]
    fn test_expiring_ca_is_replaced_with_all_leaves() {
        let (spec, network) = setup();
        let desired = required_certificates(&spec, &network);

        let short_lived = CertificateAuthority::with_validity_days(CA_COMMON_NAME, 5).unwrap();
        let mut entries = BTreeMap::new();
        entries.insert(
            CertificateName::Ca,
            CertificateKeyPair {
                certificate: short_lived.ca_cert_pem().to_string(),
                key: short_lived.ca_key_pem().to_string(),
            },
        );
        for request in &desired {
            let leaf = short_lived.issue(&request.leaf).unwrap();
            entries.insert(
                request.name.clone(),
                CertificateKeyPair {
                    certificate: leaf.cert_pem,
                    key: leaf.key_pem,
                },
            );
        }
        let existing = CertificateBundle::new(entries).unwrap();

        let renewed = X509Pki.generate_or_reuse(&desired, Some(&existing)).unwrap();
        assert_ne!(renewed.ca(), existing.ca());
        let ca = inspect_certificate(&renewed.ca().certificate).unwrap();
        assert!(ca.not_after > chrono::Utc::now().timestamp() + RENEW_BEFORE_SECS);
        for request in &desired {
            assert_ne!(renewed.get(&request.name), existing.get(&request.name));
        }
    }

    #[test]
    fn test_removed_host_leaf_is_dropped() {
        let (spec, network) = setup();
        let first = X509Pki
            .generate_or_reuse(&required_certificates(&spec, &network), None)
            .unwrap();

        let mut smaller = spec.clone();
        smaller.hosts.truncate(1);
        let second = X509Pki
            .generate_or_reuse(&required_certificates(&smaller, &network), Some(&first))
            .unwrap();

        assert!(second
            .get(&CertificateName::ApiServer("10.0.0.6".to_string()))
            .is_none());
        assert_eq!(first.ca(), second.ca());
    }

    #[tokio::test]
    async fn test_provision_runs_off_the_async_runtime() {
        let (spec, network) = setup();
        let bundle = provision(&spec, &network, None, AuthType::X509, Arc::new(X509Pki))
            .await
            .unwrap();
        assert!(bundle.ca().certificate.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
