//! Hosts with an open channel to their container runtime.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterSpec, HostSpec, Role};
use crate::error::{ProvisionError, Stage};
use crate::fanout::{collect_stage, run_per_host};
use crate::runtime::{ContainerRuntime, Dialer};

/// A cluster host together with its runtime handle for this run.
pub struct Host {
    spec: HostSpec,
    runtime: Box<dyn ContainerRuntime>,
}

impl Host {
    pub fn new(spec: HostSpec, runtime: Box<dyn ContainerRuntime>) -> Self {
        Self { spec, runtime }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.spec.has_role(role)
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Release the channel. Failures are logged; there is nothing to retry.
    pub async fn close(self) {
        if let Err(e) = self.runtime.close().await {
            warn!(host = %self.spec.address, error = %e, "Failed to close host channel");
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.spec.address)
            .field("roles", &self.spec.roles)
            .finish_non_exhaustive()
    }
}

/// Open a channel to every host concurrently.
///
/// Either every host is reachable and all are returned in declaration order,
/// or the channels that did open are closed again and the error is returned.
pub async fn tunnel_hosts(
    spec: &ClusterSpec,
    dialer: &dyn Dialer,
    token: &CancellationToken,
) -> Result<Vec<Host>, ProvisionError> {
    let tasks = spec
        .hosts
        .iter()
        .map(|host| {
            (host.address.clone(), async move {
                let runtime = dialer
                    .dial(host)
                    .await
                    .map_err(|source| ProvisionError::Connectivity {
                        host: host.address.clone(),
                        source,
                    })?;
                info!("Host reachable");
                Ok::<_, ProvisionError>(Host::new(host.clone(), runtime))
            })
        })
        .collect();

    let results = run_per_host(Stage::Tunnel, token, tasks).await;
    match collect_stage(Stage::Tunnel, results) {
        Ok(hosts) => Ok(hosts),
        Err((err, opened)) => {
            close_all(opened).await;
            Err(err)
        }
    }
}

/// Close every host channel.
pub async fn close_all(hosts: Vec<Host>) {
    futures_util::future::join_all(hosts.into_iter().map(Host::close)).await;
}
