//! Plane deployment.
//!
//! Phases run in role order (etcd, controlplane, worker) and each is a
//! barrier: a phase starts only after every host in the previous one applied
//! all of its components. Hosts within a phase deploy concurrently; the
//! components on one host deploy in a fixed order.

use fleetkube_reconcile::{plan_apply, ApplyAction, Observed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::auth::CertificateBundle;
use crate::cluster::Role;
use crate::error::{ProvisionError, Stage};
use crate::fanout::{collect_stage, run_per_host};
use crate::hosts::Host;
use crate::prepare::{credentials_digest, files_for_host, CREDENTIALS_DIGEST_ENV};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, SPEC_HASH_LABEL};
use crate::services::{build_container_spec, Component, PlaneContext};

/// Converge one named container on `runtime` to `desired`.
///
/// The spec hash is recorded as a label so later runs can compare without
/// reconstructing the spec.
pub async fn apply_container(
    runtime: &dyn ContainerRuntime,
    desired: &ContainerSpec,
) -> Result<ApplyAction, RuntimeError> {
    let hash = desired.spec_hash();
    let mut desired = desired.clone();
    desired
        .labels
        .insert(SPEC_HASH_LABEL.to_string(), hash.as_str().to_string());

    let current = runtime.inspect(&desired.name).await?;
    let recorded = current.as_ref().map(|c| (c.recorded_hash(), c.running));
    let observed = recorded.as_ref().map(|(spec_hash, running)| Observed {
        spec_hash,
        running: *running,
    });

    let action = plan_apply(&hash, desired.lifecycle(), observed);
    match action {
        ApplyAction::Noop => {
            debug!(container = %desired.name, "Container up to date");
        }
        ApplyAction::Start => {
            runtime.start(&desired.name).await?;
        }
        ApplyAction::Create => {
            runtime.create_and_start(&desired).await?;
        }
        ApplyAction::Recreate => {
            runtime.remove(&desired.name).await?;
            runtime.create_and_start(&desired).await?;
        }
    }
    Ok(action)
}

async fn deploy_host(
    host: &Host,
    role: Role,
    ctx: &PlaneContext<'_>,
    bundle: &CertificateBundle,
) -> Result<(), ProvisionError> {
    let digest = credentials_digest(&files_for_host(host.spec(), ctx, bundle)?);

    for component in Component::for_role(role) {
        let desired = build_container_spec(*component, host.spec(), ctx)
            .with_env(CREDENTIALS_DIGEST_ENV, digest.as_str());

        let action = apply_container(host.runtime(), &desired)
            .await
            .map_err(|cause| ProvisionError::Deployment {
                stage: Stage::Deploy(role),
                host: host.address().to_string(),
                component: component.container_name().to_string(),
                cause,
            })?;

        info!(component = %component, action = %action, "Component applied");
    }
    Ok(())
}

/// Deploy every phase in order.
pub async fn deploy_planes(
    hosts: &[Host],
    ctx: &PlaneContext<'_>,
    bundle: &CertificateBundle,
    token: &CancellationToken,
) -> Result<(), ProvisionError> {
    for role in Role::PHASES {
        let stage = Stage::Deploy(role);
        if token.is_cancelled() {
            return Err(ProvisionError::Cancelled { stage });
        }

        let tasks: Vec<_> = hosts
            .iter()
            .filter(|host| host.has_role(role))
            .map(|host| {
                (
                    host.address().to_string(),
                    deploy_host(host, role, ctx, bundle),
                )
            })
            .collect();
        let span = info_span!("stage", stage = %stage);
        async {
            info!(phase = %role, hosts = tasks.len(), "Deploying phase");
            let results = run_per_host(stage, token, tasks).await;
            collect_stage(stage, results).map_err(|(e, _)| e.at_stage(stage))?;
            info!(phase = %role, "Phase complete");
            Ok::<_, ProvisionError>(())
        }
        .instrument(span)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{required_certificates, PkiService, X509Pki};
    use crate::cluster::ClusterSpec;
    use crate::runtime::{Dialer, MockFleet, MockOpKind};
    use crate::services::tests::{cluster, context};

    fn bundle(spec: &ClusterSpec) -> CertificateBundle {
        let ctx = context(spec);
        X509Pki
            .generate_or_reuse(&required_certificates(spec, &ctx.network), None)
            .unwrap()
    }

    async fn dial_all(fleet: &MockFleet, spec: &ClusterSpec) -> Vec<Host> {
        let mut hosts = Vec::new();
        for host in &spec.hosts {
            hosts.push(Host::new(host.clone(), fleet.dial(host).await.unwrap()));
        }
        hosts
    }

    fn web(image: &str) -> ContainerSpec {
        ContainerSpec::new("web", image, vec!["serve".to_string()])
    }

    #[tokio::test]
    async fn test_apply_container_plans() {
        let fleet = MockFleet::new();
        let host = cluster().hosts[0].clone();
        let runtime = fleet.dial(&host).await.unwrap();

        let first = apply_container(runtime.as_ref(), &web("nginx:1")).await.unwrap();
        assert_eq!(first, ApplyAction::Create);
        let again = apply_container(runtime.as_ref(), &web("nginx:1")).await.unwrap();
        assert_eq!(again, ApplyAction::Noop);

        fleet.stop(&host.address, "web");
        let restarted = apply_container(runtime.as_ref(), &web("nginx:1")).await.unwrap();
        assert_eq!(restarted, ApplyAction::Start);

        let changed = apply_container(runtime.as_ref(), &web("nginx:2")).await.unwrap();
        assert_eq!(changed, ApplyAction::Recreate);
        assert_eq!(fleet.mutation_count(), 3);

        let stored = fleet.container(&host.address, "web").unwrap();
        assert_eq!(stored.spec.image, "nginx:2");
        assert_eq!(
            stored.spec.labels.get(SPEC_HASH_LABEL).map(String::as_str),
            Some(web("nginx:2").spec_hash().as_str())
        );
    }

    #[tokio::test]
    async fn test_phases_are_barriers() {
        let spec = cluster();
        let ctx = context(&spec);
        let bundle = bundle(&spec);
        let fleet = MockFleet::new();
        let hosts = dial_all(&fleet, &spec).await;

        deploy_planes(&hosts, &ctx, &bundle, &CancellationToken::new())
            .await
            .unwrap();

        let roles: Vec<Role> = fleet
            .operations()
            .iter()
            .filter(|op| op.kind == MockOpKind::Create)
            .map(|op| match op.container.as_str() {
                "etcd" => Role::Etcd,
                "kubelet" | "kube-proxy" => Role::Worker,
                _ => Role::ControlPlane,
            })
            .collect();
        let mut sorted = roles.clone();
        sorted.sort();
        assert_eq!(roles, sorted);
        assert_eq!(roles.len(), 2 + 2 * 3 + 2 * 2);
    }

    #[tokio::test]
    async fn test_components_deploy_in_order_per_host() {
        let spec = cluster();
        let ctx = context(&spec);
        let bundle = bundle(&spec);
        let fleet = MockFleet::new();
        let hosts = dial_all(&fleet, &spec).await;

        deploy_planes(&hosts, &ctx, &bundle, &CancellationToken::new())
            .await
            .unwrap();

        let on_second: Vec<String> = fleet
            .operations()
            .into_iter()
            .filter(|op| op.host == "10.0.0.6")
            .map(|op| op.container)
            .collect();
        assert_eq!(on_second, ["etcd", "kube-api", "kube-controller", "scheduler"]);
    }

    #[tokio::test]
    async fn test_failed_phase_stops_later_phases() {
        let spec = cluster();
        let ctx = context(&spec);
        let bundle = bundle(&spec);
        let fleet = MockFleet::new();
        fleet.fail_create("10.0.0.6", "kube-api");
        let hosts = dial_all(&fleet, &spec).await;

        let err = deploy_planes(&hosts, &ctx, &bundle, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Deploy(Role::ControlPlane));
        assert_eq!(err.host(), Some("10.0.0.6"));
        assert!(fleet
            .operations()
            .iter()
            .all(|op| op.container != "kubelet" && op.container != "kube-proxy"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_phase() {
        let spec = cluster();
        let ctx = context(&spec);
        let bundle = bundle(&spec);
        let fleet = MockFleet::new();
        let hosts = dial_all(&fleet, &spec).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = deploy_planes(&hosts, &ctx, &bundle, &token).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Cancelled {
                stage: Stage::Deploy(Role::Etcd)
            }
        ));
        assert_eq!(fleet.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_new_certificate_recreates_its_components() {
        let spec = cluster();
        let ctx = context(&spec);
        let first = bundle(&spec);
        let fleet = MockFleet::new();
        let hosts = dial_all(&fleet, &spec).await;
        let token = CancellationToken::new();

        deploy_planes(&hosts, &ctx, &first, &token).await.unwrap();
        let before = fleet.mutation_count();
        deploy_planes(&hosts, &ctx, &first, &token).await.unwrap();
        assert_eq!(fleet.mutation_count(), before);

        let second = bundle(&spec);
        deploy_planes(&hosts, &ctx, &second, &token).await.unwrap();
        assert!(fleet
            .operations()
            .iter()
            .skip(before)
            .any(|op| op.container == "kube-api" && op.kind == MockOpKind::Remove));
    }
}
