//! Host preparation.
//!
//! Before any component starts, every host receives the credential files its
//! roles need. A one-shot `cert-deployer` container carries the file contents
//! in its environment and writes them into the bind-mounted configuration
//! directory. It goes through the same idempotent apply as the components, so
//! an unchanged bundle leaves hosts untouched on re-runs.

use fleetkube_reconcile::SpecHash;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthError, CertificateBundle, CertificateName};
use crate::cluster::{HostSpec, Role};
use crate::deploy::apply_container;
use crate::error::{ProvisionError, Stage};
use crate::fanout::{collect_stage, run_per_host};
use crate::hosts::Host;
use crate::kubeconfig::KubeConfig;
use crate::paths::{
    ca_cert_path, cert_path, https_url, key_path, kubeconfig_path, API_PORT, CONFIG_DIR_BIND,
    SSL_DIR,
};
use crate::runtime::{ContainerSpec, RuntimeError};
use crate::services::PlaneContext;

/// Name of the one-shot container that writes credentials.
pub const CERT_DEPLOYER: &str = "cert-deployer";

/// Environment entry tying each component container to its host's credentials.
pub const CREDENTIALS_DIGEST_ENV: &str = "FLEETKUBE_CREDENTIALS_DIGEST";

const FILE_ENV_PREFIX: &str = "FLEETKUBE_FILE_";

/// A file to place on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFile {
    pub path: String,
    pub contents: String,
}

struct FileSet<'a> {
    bundle: &'a CertificateBundle,
    files: Vec<HostFile>,
}

impl FileSet<'_> {
    fn push(&mut self, path: String, contents: &str) {
        self.files.push(HostFile {
            path,
            contents: contents.to_string(),
        });
    }

    fn pair(&mut self, name: &CertificateName) -> Result<(), AuthError> {
        let pair = self.bundle.require(name)?;
        self.push(cert_path(name), &pair.certificate);
        self.push(key_path(name), &pair.key);
        Ok(())
    }

    /// Certificate, key and a kubeconfig referencing them.
    fn client(
        &mut self,
        name: &CertificateName,
        user: &str,
        server: &str,
    ) -> Result<(), AuthError> {
        self.pair(name)?;
        let config = KubeConfig::for_component(
            server,
            user,
            &ca_cert_path(),
            &cert_path(name),
            &key_path(name),
        );
        self.push(kubeconfig_path(name), &config.to_yaml()?);
        Ok(())
    }
}

/// Every credential file `host` needs for its roles, in a stable order.
pub fn files_for_host(
    host: &HostSpec,
    ctx: &PlaneContext<'_>,
    bundle: &CertificateBundle,
) -> Result<Vec<HostFile>, AuthError> {
    let mut set = FileSet {
        bundle,
        files: Vec::new(),
    };
    set.push(ca_cert_path(), &bundle.ca().certificate);

    if host.has_role(Role::Etcd) {
        set.pair(&CertificateName::Etcd(host.address.clone()))?;
    }

    if host.has_role(Role::ControlPlane) {
        let local = https_url("127.0.0.1", API_PORT);
        set.pair(&CertificateName::ApiServer(host.address.clone()))?;
        set.pair(&CertificateName::ServiceAccountToken)?;
        set.client(
            &CertificateName::ControllerManager,
            "system:kube-controller-manager",
            &local,
        )?;
        set.client(&CertificateName::Scheduler, "system:kube-scheduler", &local)?;
    }

    if host.has_role(Role::Worker) {
        set.client(&CertificateName::Node, "system:node", &ctx.api_server_url)?;
        set.client(&CertificateName::Proxy, "system:kube-proxy", &ctx.api_server_url)?;
    }

    Ok(set.files)
}

/// Hash over a host's credential files.
pub fn credentials_digest(files: &[HostFile]) -> SpecHash {
    SpecHash::from_json(&serde_json::json!(files))
}

/// The one-shot container that writes `files` and exits.
pub fn cert_deployer_spec(image: &str, files: &[HostFile]) -> ContainerSpec {
    let mut script = format!("set -e; mkdir -p {}; umask 077", SSL_DIR);
    let mut spec = ContainerSpec::new(CERT_DEPLOYER, image, Vec::new());
    for (i, file) in files.iter().enumerate() {
        let var = format!("{}{}", FILE_ENV_PREFIX, i);
        script.push_str(&format!("; printf '%s' \"${}\" > '{}'", var, file.path));
        spec = spec.with_env(&var, &file.contents);
    }
    spec.command = vec!["sh".to_string(), "-c".to_string(), script];
    spec.with_binds([CONFIG_DIR_BIND]).run_once()
}

async fn prepare_host(
    host: &Host,
    ctx: &PlaneContext<'_>,
    bundle: &CertificateBundle,
) -> Result<(), ProvisionError> {
    let files = files_for_host(host.spec(), ctx, bundle)?;
    let desired = cert_deployer_spec(&ctx.spec.system_images.cert_deployer, &files);
    let runtime = host.runtime();
    let failed = |cause: RuntimeError| ProvisionError::Deployment {
        stage: Stage::PrepareHosts,
        host: host.address().to_string(),
        component: CERT_DEPLOYER.to_string(),
        cause,
    };

    let action = apply_container(runtime, &desired).await.map_err(failed)?;
    if !action.is_mutation() {
        info!(files = files.len(), "Credentials already in place");
        return Ok(());
    }

    let code = runtime.wait(CERT_DEPLOYER).await.map_err(failed)?;
    if code != 0 {
        // A failed deployer must not look converged to the next run.
        if let Err(e) = runtime.remove(CERT_DEPLOYER).await {
            warn!(error = %e, "Failed to remove cert-deployer");
        }
        return Err(failed(RuntimeError::Exited {
            name: CERT_DEPLOYER.to_string(),
            code,
        }));
    }

    info!(files = files.len(), action = %action, "Credentials written");
    Ok(())
}

/// Write credentials to every host concurrently.
pub async fn prepare_hosts(
    hosts: &[Host],
    ctx: &PlaneContext<'_>,
    bundle: &CertificateBundle,
    token: &CancellationToken,
) -> Result<(), ProvisionError> {
    let tasks = hosts
        .iter()
        .map(|host| (host.address().to_string(), prepare_host(host, ctx, bundle)))
        .collect();

    let results = run_per_host(Stage::PrepareHosts, token, tasks).await;
    collect_stage(Stage::PrepareHosts, results)
        .map(|_| ())
        .map_err(|(e, _)| e.at_stage(Stage::PrepareHosts))
}
