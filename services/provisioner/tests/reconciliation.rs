//! Integration tests for repeated runs against the same fleet.
//!
//! Each test brings a cluster up on a [`MockFleet`], changes something
//! (nothing, an image, a crashed container, an extra host) and checks that
//! the next run touches exactly what it has to.

use std::path::Path;
use std::sync::Arc;

use fleetkube_provisioner::runtime::MockOpKind;
use fleetkube_provisioner::{
    ClusterSpec, DiscoveryStrategy, FileStateStore, MockFleet, Pipeline, X509Pki,
};
use tokio_util::sync::CancellationToken;

const CLUSTER: &str = r#"
hosts:
  - address: 10.0.0.5
    hostname: cp-1
    roles: [etcd, controlplane]
  - address: 10.0.0.6
    hostname: cp-2
    roles: [etcd, controlplane]
  - address: 10.0.0.7
    hostname: worker-1
    roles: [worker]
services:
  etcd: { image: "quay.io/coreos/etcd:v3.5.9" }
  kube-api: { image: rancher/k8s:v1.8.3-rancher2 }
  kube-controller: { image: rancher/k8s:v1.8.3-rancher2 }
  scheduler: { image: rancher/k8s:v1.8.3-rancher2 }
  kubelet: { image: rancher/k8s:v1.8.3-rancher2 }
  kubeproxy: { image: rancher/k8s:v1.8.3-rancher2 }
"#;

fn spec() -> ClusterSpec {
    ClusterSpec::parse(CLUSTER).unwrap()
}

fn pipeline(fleet: &MockFleet, dir: &Path) -> Pipeline {
    Pipeline::new(
        Arc::new(fleet.clone()),
        Arc::new(FileStateStore::new(dir.join("cluster.state.yml"))),
        Arc::new(X509Pki),
    )
}

#[tokio::test]
async fn test_second_run_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    let first = pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();
    let after_first = fleet.mutation_count();
    // 3 cert-deployers, 2 etcd, 2 x 3 control plane, 2 worker components.
    assert_eq!(after_first, 3 + 2 + 6 + 2);

    let second = pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();

    assert_eq!(fleet.mutation_count(), after_first);
    assert_eq!(first, second);
    assert_eq!(fleet.open_handles(), 0);
}

#[tokio::test]
async fn test_fresh_discovery_rotates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    let first = pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();
    let after_first = fleet.mutation_count();

    let second = pipeline(&fleet, dir.path())
        .with_discovery(DiscoveryStrategy::Fresh)
        .up(&spec(), "x509", &token)
        .await
        .unwrap();

    assert_ne!(first.ca_cert_pem, second.ca_cert_pem);
    // Every container is removed and created again.
    assert_eq!(fleet.mutation_count(), after_first * 3);
}

#[tokio::test]
async fn test_crashed_component_is_started_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();
    let before = fleet.operations().len();
    fleet.stop("10.0.0.6", "scheduler");

    pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();

    let ops = fleet.operations();
    let new_ops = &ops[before..];
    assert_eq!(new_ops.len(), 1);
    assert_eq!(new_ops[0].host, "10.0.0.6");
    assert_eq!(new_ops[0].container, "scheduler");
    assert_eq!(new_ops[0].kind, MockOpKind::Start);
    assert!(fleet.container("10.0.0.6", "scheduler").unwrap().running);
}

#[tokio::test]
async fn test_image_change_recreates_only_that_component() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();
    let before = fleet.operations().len();

    let mut upgraded = spec();
    upgraded.services.kube_api.image = "rancher/k8s:v1.9.0-rancher1".to_string();
    pipeline(&fleet, dir.path())
        .up(&upgraded, "x509", &token)
        .await
        .unwrap();

    let ops = fleet.operations();
    let touched: Vec<(&str, &str, MockOpKind)> = ops[before..]
        .iter()
        .map(|op| (op.host.as_str(), op.container.as_str(), op.kind))
        .collect();
    let mut expected = vec![
        ("10.0.0.5", "kube-api", MockOpKind::Remove),
        ("10.0.0.5", "kube-api", MockOpKind::Create),
        ("10.0.0.6", "kube-api", MockOpKind::Remove),
        ("10.0.0.6", "kube-api", MockOpKind::Create),
    ];
    let mut touched_sorted = touched.clone();
    touched_sorted.sort_by_key(|(host, _, kind)| (host.to_string(), *kind == MockOpKind::Create));
    expected.sort_by_key(|(host, _, kind)| (host.to_string(), *kind == MockOpKind::Create));
    assert_eq!(touched_sorted, expected);
    assert_eq!(
        fleet.container("10.0.0.5", "kube-api").unwrap().spec.image,
        "rancher/k8s:v1.9.0-rancher1"
    );
}

#[tokio::test]
async fn test_added_worker_leaves_existing_hosts_alone() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    let first = pipeline(&fleet, dir.path())
        .up(&spec(), "x509", &token)
        .await
        .unwrap();
    let before = fleet.operations().len();

    let grown = ClusterSpec::parse(&CLUSTER.replace(
        "services:",
        "  - address: 10.0.0.8\n    hostname: worker-2\n    roles: [worker]\nservices:",
    ))
    .unwrap();
    let second = pipeline(&fleet, dir.path())
        .up(&grown, "x509", &token)
        .await
        .unwrap();

    assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
    let ops = fleet.operations();
    assert!(ops[before..].iter().all(|op| op.host == "10.0.0.8"));
    let created: Vec<&str> = ops[before..].iter().map(|op| op.container.as_str()).collect();
    assert_eq!(created, ["cert-deployer", "kubelet", "kube-proxy"]);
}
