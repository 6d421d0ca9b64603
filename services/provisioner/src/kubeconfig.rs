//! Kubeconfig documents.
//!
//! Components on the hosts get kubeconfigs that reference certificate files
//! by path. The admin kubeconfig handed back to the operator embeds the PEM
//! data so it works from any machine.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

const CLUSTER_NAME: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
}

impl KubeConfig {
    fn single(server: &str, user: &str, cluster: ClusterEntry, credentials: UserEntry) -> Self {
        let context = format!("{}@{}", user, CLUSTER_NAME);
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.to_string(),
                cluster: ClusterEntry {
                    server: server.to_string(),
                    ..cluster
                },
            }],
            users: vec![NamedUser {
                name: user.to_string(),
                user: credentials,
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextEntry {
                    cluster: CLUSTER_NAME.to_string(),
                    user: user.to_string(),
                },
            }],
            current_context: context,
        }
    }

    /// Kubeconfig for a component on a host, referencing files by path.
    pub fn for_component(
        server: &str,
        user: &str,
        ca_path: &str,
        cert_path: &str,
        key_path: &str,
    ) -> Self {
        Self::single(
            server,
            user,
            ClusterEntry {
                server: String::new(),
                certificate_authority: Some(ca_path.to_string()),
                certificate_authority_data: None,
            },
            UserEntry {
                client_certificate: Some(cert_path.to_string()),
                client_key: Some(key_path.to_string()),
                client_certificate_data: None,
                client_key_data: None,
            },
        )
    }

    /// Self-contained kubeconfig with embedded credentials.
    pub fn embedded(server: &str, user: &str, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Self {
        let encode = |pem: &str| base64::engine::general_purpose::STANDARD.encode(pem);
        Self::single(
            server,
            user,
            ClusterEntry {
                server: String::new(),
                certificate_authority: None,
                certificate_authority_data: Some(encode(ca_pem)),
            },
            UserEntry {
                client_certificate: None,
                client_key: None,
                client_certificate_data: Some(encode(cert_pem)),
                client_key_data: Some(encode(key_pem)),
            },
        )
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
