//! The reconciliation pipeline.
//!
//! One run takes a cluster spec from declared to running:
//!
//! 1. Resolve everything that can be checked locally (auth mode, networks).
//! 2. Open a channel to every host.
//! 3. Discover the previous run's state.
//! 4. Produce the certificate bundle, reusing what the previous run issued.
//! 5. Write credentials to every host.
//! 6. Deploy etcd, then the control plane, then workers.
//! 7. Persist the applied spec and bundle.
//!
//! Every stage is a barrier and the first failing stage ends the run. Host
//! channels opened in step 2 are closed on every exit path.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::auth::{self, AuthType, CertificateBundle, PkiService};
use crate::cluster::{ClusterNetwork, ClusterSpec};
use crate::config::DiscoveryStrategy;
use crate::deploy::deploy_planes;
use crate::error::{ProvisionError, Stage};
use crate::hosts::{close_all, tunnel_hosts, Host};
use crate::kubeconfig::KubeConfig;
use crate::prepare::prepare_hosts;
use crate::runtime::Dialer;
use crate::services::PlaneContext;
use crate::state::{discover, ClusterState, StateStore};

const ADMIN_USER: &str = "kube-admin";

/// What a successful run hands back to the operator.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterUpOutput {
    pub api_url: String,
    pub ca_cert_pem: String,
    pub admin_cert_pem: String,
    pub admin_key_pem: String,
}

impl ClusterUpOutput {
    fn new(api_url: String, bundle: &CertificateBundle) -> Self {
        Self {
            api_url,
            ca_cert_pem: bundle.ca().certificate.clone(),
            admin_cert_pem: bundle.admin().certificate.clone(),
            admin_key_pem: bundle.admin().key.clone(),
        }
    }

    /// A self-contained admin kubeconfig for the new cluster.
    pub fn admin_kubeconfig(&self) -> Result<String, serde_yaml::Error> {
        KubeConfig::embedded(
            &self.api_url,
            ADMIN_USER,
            &self.ca_cert_pem,
            &self.admin_cert_pem,
            &self.admin_key_pem,
        )
        .to_yaml()
    }
}

impl std::fmt::Debug for ClusterUpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterUpOutput")
            .field("api_url", &self.api_url)
            .field("admin_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Run `stage` inside its span unless the run is already cancelled.
async fn run_stage<T, F>(
    stage: Stage,
    token: &CancellationToken,
    work: F,
) -> Result<T, ProvisionError>
where
    F: Future<Output = Result<T, ProvisionError>>,
{
    if token.is_cancelled() {
        return Err(ProvisionError::Cancelled { stage });
    }
    async {
        info!("Stage started");
        let result = work.await.map_err(|e| e.at_stage(stage));
        if result.is_ok() {
            info!("Stage complete");
        }
        result
    }
    .instrument(info_span!("stage", stage = %stage))
    .await
}

/// Provisions clusters through pluggable host, state and PKI backends.
pub struct Pipeline {
    dialer: Arc<dyn Dialer>,
    store: Arc<dyn StateStore>,
    pki: Arc<dyn PkiService>,
    discovery: DiscoveryStrategy,
}

impl Pipeline {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        store: Arc<dyn StateStore>,
        pki: Arc<dyn PkiService>,
    ) -> Self {
        Self {
            dialer,
            store,
            pki,
            discovery: DiscoveryStrategy::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryStrategy) -> Self {
        self.discovery = discovery;
        self
    }

    /// Load the cluster file at `path` and bring the cluster up.
    pub async fn up_from_file(
        &self,
        path: &Path,
        auth_type: &str,
        token: &CancellationToken,
    ) -> Result<ClusterUpOutput, ProvisionError> {
        let spec = run_stage(Stage::LoadSpec, token, async {
            Ok::<_, ProvisionError>(ClusterSpec::load(path)?)
        })
        .await?;
        self.up(&spec, auth_type, token).await
    }

    /// Bring the cluster described by `spec` to its desired state.
    pub async fn up(
        &self,
        spec: &ClusterSpec,
        auth_type: &str,
        token: &CancellationToken,
    ) -> Result<ClusterUpOutput, ProvisionError> {
        // Nothing below may contact a host before these checks pass.
        let auth: AuthType = auth_type.parse()?;
        spec.validate()?;
        let network = ClusterNetwork::from_spec(spec)?;
        let ctx = PlaneContext::new(spec, network)?;

        let hosts = run_stage(Stage::Tunnel, token, async {
            tunnel_hosts(spec, self.dialer.as_ref(), token).await
        })
        .await?;
        info!(hosts = hosts.len(), "All hosts reachable");

        let result = self.reconcile(&hosts, &ctx, auth, token).await;
        close_all(hosts).await;

        if let Ok(output) = &result {
            info!(api_url = %output.api_url, "Cluster is up");
        }
        result
    }

    async fn reconcile(
        &self,
        hosts: &[Host],
        ctx: &PlaneContext<'_>,
        auth: AuthType,
        token: &CancellationToken,
    ) -> Result<ClusterUpOutput, ProvisionError> {
        let previous = run_stage(Stage::Discover, token, async {
            Ok::<_, ProvisionError>(discover(self.discovery, self.store.as_ref()).await?)
        })
        .await?;

        let bundle = run_stage(Stage::Authenticate, token, async {
            let existing = previous.as_ref().map(|state| &state.certificates);
            let bundle =
                auth::provision(ctx.spec, &ctx.network, existing, auth, self.pki.clone()).await?;
            Ok::<_, ProvisionError>(bundle)
        })
        .await?;

        run_stage(
            Stage::PrepareHosts,
            token,
            prepare_hosts(hosts, ctx, &bundle, token),
        )
        .await?;

        deploy_planes(hosts, ctx, &bundle, token).await?;

        let state = ClusterState::new(ctx.spec.clone(), bundle);
        run_stage(Stage::Persist, token, async {
            Ok::<_, ProvisionError>(self.store.save(&state).await?)
        })
        .await?;

        Ok(ClusterUpOutput::new(
            ctx.api_server_url.clone(),
            &state.certificates,
        ))
    }
}
