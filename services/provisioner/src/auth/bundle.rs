//! Typed certificate registry.

use std::collections::BTreeMap;
use std::str::FromStr;

use fleetkube_pki::{inspect_certificate, validate_private_key, verify_signed_by, PkiError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Name of a certificate in the cluster bundle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CertificateName {
    Ca,
    Admin,
    ControllerManager,
    Scheduler,
    Node,
    Proxy,
    /// Key pair signing service-account tokens; shared by every control plane.
    ServiceAccountToken,
    /// Serving certificate of the API server on one control-plane host.
    ApiServer(String),
    /// Peer and serving certificate of etcd on one etcd host.
    Etcd(String),
}

impl CertificateName {
    pub fn is_ca(&self) -> bool {
        matches!(self, CertificateName::Ca)
    }

    /// Base file name under the certificate directory, without extension.
    pub fn file_stem(&self) -> &'static str {
        match self {
            CertificateName::Ca => "kube-ca",
            CertificateName::Admin => "kube-admin",
            CertificateName::ControllerManager => "kube-controller-manager",
            CertificateName::Scheduler => "kube-scheduler",
            CertificateName::Node => "kube-node",
            CertificateName::Proxy => "kube-proxy",
            CertificateName::ServiceAccountToken => "kube-service-account-token",
            CertificateName::ApiServer(_) => "kube-apiserver",
            CertificateName::Etcd(_) => "kube-etcd",
        }
    }
}

impl std::fmt::Display for CertificateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateName::ApiServer(host) | CertificateName::Etcd(host) => {
                write!(f, "{}@{}", self.file_stem(), host)
            }
            _ => f.write_str(self.file_stem()),
        }
    }
}

impl FromStr for CertificateName {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = match s.split_once('@') {
            Some(("kube-apiserver", host)) if !host.is_empty() => {
                CertificateName::ApiServer(host.to_string())
            }
            Some(("kube-etcd", host)) if !host.is_empty() => CertificateName::Etcd(host.to_string()),
            Some(_) => return Err(BundleError::UnknownName(s.to_string())),
            None => match s {
                "kube-ca" => CertificateName::Ca,
                "kube-admin" => CertificateName::Admin,
                "kube-controller-manager" => CertificateName::ControllerManager,
                "kube-scheduler" => CertificateName::Scheduler,
                "kube-node" => CertificateName::Node,
                "kube-proxy" => CertificateName::Proxy,
                "kube-service-account-token" => CertificateName::ServiceAccountToken,
                _ => return Err(BundleError::UnknownName(s.to_string())),
            },
        };
        Ok(name)
    }
}

impl TryFrom<String> for CertificateName {
    type Error = BundleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CertificateName> for String {
    fn from(name: CertificateName) -> Self {
        name.to_string()
    }
}

/// A PEM certificate and its PEM private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateKeyPair {
    pub certificate: String,
    pub key: String,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("unknown certificate name {0:?}")]
    UnknownName(String),

    #[error("bundle is missing required certificate {0}")]
    Missing(CertificateName),

    #[error("{0} is not a certificate authority")]
    NotAuthority(CertificateName),

    #[error("certificate {0} is not signed by the cluster CA")]
    NotSignedByCa(CertificateName),

    #[error("certificate {name}: {source}")]
    Invalid {
        name: CertificateName,
        #[source]
        source: PkiError,
    },
}

static CA: CertificateName = CertificateName::Ca;
static ADMIN: CertificateName = CertificateName::Admin;

fn invalid(name: &CertificateName) -> impl FnOnce(PkiError) -> BundleError {
    let name = name.clone();
    move |source| BundleError::Invalid { name, source }
}

/// Every certificate of a cluster, all chained to one CA.
///
/// Construction verifies the whole bundle once: the CA and admin entries
/// exist, the CA is an authority, and every other entry has a parseable key
/// and is signed by that CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    ca: CertificateKeyPair,
    admin: CertificateKeyPair,
    leaves: BTreeMap<CertificateName, CertificateKeyPair>,
}

impl CertificateBundle {
    pub fn new(
        mut entries: BTreeMap<CertificateName, CertificateKeyPair>,
    ) -> Result<Self, BundleError> {
        let ca = entries
            .remove(&CertificateName::Ca)
            .ok_or(BundleError::Missing(CertificateName::Ca))?;
        let admin = entries
            .remove(&CertificateName::Admin)
            .ok_or(BundleError::Missing(CertificateName::Admin))?;

        let info = inspect_certificate(&ca.certificate).map_err(invalid(&CertificateName::Ca))?;
        if !info.is_ca {
            return Err(BundleError::NotAuthority(CertificateName::Ca));
        }
        validate_private_key(&ca.key).map_err(invalid(&CertificateName::Ca))?;

        let leaves = std::iter::once((&ADMIN, &admin)).chain(entries.iter());
        for (name, pair) in leaves {
            validate_private_key(&pair.key).map_err(invalid(name))?;
            if !verify_signed_by(&pair.certificate, &ca.certificate).map_err(invalid(name))? {
                return Err(BundleError::NotSignedByCa(name.clone()));
            }
        }

        Ok(Self {
            ca,
            admin,
            leaves: entries,
        })
    }

    pub fn ca(&self) -> &CertificateKeyPair {
        &self.ca
    }

    pub fn admin(&self) -> &CertificateKeyPair {
        &self.admin
    }

    pub fn get(&self, name: &CertificateName) -> Option<&CertificateKeyPair> {
        match name {
            CertificateName::Ca => Some(&self.ca),
            CertificateName::Admin => Some(&self.admin),
            other => self.leaves.get(other),
        }
    }

    /// Like [`get`](Self::get), for certificates a caller cannot proceed without.
    pub fn require(&self, name: &CertificateName) -> Result<&CertificateKeyPair, BundleError> {
        self.get(name)
            .ok_or_else(|| BundleError::Missing(name.clone()))
    }

    /// All entries in name order, CA first.
    pub fn iter(&self) -> impl Iterator<Item = (&CertificateName, &CertificateKeyPair)> + '_ {
        [(&CA, &self.ca), (&ADMIN, &self.admin)]
            .into_iter()
            .chain(self.leaves.iter())
    }

    pub fn len(&self) -> usize {
        self.leaves.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Serialize for CertificateBundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for CertificateBundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<CertificateName, CertificateKeyPair>::deserialize(deserializer)?;
        CertificateBundle::new(entries).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetkube_pki::{CertificateAuthority, LeafRequest, LeafUsage, Subject};

    fn leaf(ca: &CertificateAuthority, cn: &str) -> CertificateKeyPair {
        let issued = ca
            .issue(&LeafRequest {
                subject: Subject::new(cn),
                usage: LeafUsage::Client,
                alt_names: Default::default(),
            })
            .unwrap();
        CertificateKeyPair {
            certificate: issued.cert_pem,
            key: issued.key_pem,
        }
    }

    fn ca_pair(ca: &CertificateAuthority) -> CertificateKeyPair {
        CertificateKeyPair {
            certificate: ca.ca_cert_pem().to_string(),
            key: ca.ca_key_pem().to_string(),
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for name in [
            CertificateName::Ca,
            CertificateName::Node,
            CertificateName::ServiceAccountToken,
            CertificateName::ApiServer("10.0.0.5".to_string()),
            CertificateName::Etcd("fd00::5".to_string()),
        ] {
            assert_eq!(name.to_string().parse::<CertificateName>().unwrap(), name);
        }
        assert!("kube-unknown".parse::<CertificateName>().is_err());
        assert!("kube-apiserver@".parse::<CertificateName>().is_err());
    }

    #[test]
    fn test_bundle_requires_ca_and_admin() {
        let ca = CertificateAuthority::new("kube-ca").unwrap();
        let mut entries = BTreeMap::new();
        entries.insert(CertificateName::Ca, ca_pair(&ca));

        let err = CertificateBundle::new(entries.clone()).unwrap_err();
        assert!(matches!(err, BundleError::Missing(CertificateName::Admin)));

        entries.insert(CertificateName::Admin, leaf(&ca, "kube-admin"));
        let bundle = CertificateBundle::new(entries).unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.get(&CertificateName::Node).is_none());
        assert!(bundle.require(&CertificateName::Node).is_err());
    }

    #[test]
    fn test_bundle_rejects_foreign_leaf() {
        let ca = CertificateAuthority::new("kube-ca").unwrap();
        let other = CertificateAuthority::new("kube-ca").unwrap();

        let mut entries = BTreeMap::new();
        entries.insert(CertificateName::Ca, ca_pair(&ca));
        entries.insert(CertificateName::Admin, leaf(&ca, "kube-admin"));
        entries.insert(CertificateName::Node, leaf(&other, "system:node"));

        let err = CertificateBundle::new(entries).unwrap_err();
        assert!(matches!(err, BundleError::NotSignedByCa(CertificateName::Node)));
    }

    #[test]
    fn test_bundle_serde_roundtrip() {
        let ca = CertificateAuthority::new("kube-ca").unwrap();
        let mut entries = BTreeMap::new();
        entries.insert(CertificateName::Ca, ca_pair(&ca));
        entries.insert(CertificateName::Admin, leaf(&ca, "kube-admin"));
        entries.insert(
            CertificateName::ApiServer("10.0.0.5".to_string()),
            leaf(&ca, "kube-apiserver"),
        );
        let bundle = CertificateBundle::new(entries).unwrap();

        let yaml = serde_yaml::to_string(&bundle).unwrap();
        assert!(yaml.contains("kube-apiserver@10.0.0.5"));
        let restored: CertificateBundle = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, bundle);
    }
}
