//! End-to-end cluster bring-up.
//!
//! Drives `Pipeline::up_from_file` against an in-memory fleet the same way
//! `fleetctl cluster up` drives it against real hosts:
//!
//! 1. Write a cluster file to disk
//! 2. Bring the cluster up
//! 3. Check the containers, certificates and state file it produced
//! 4. Run again and check nothing changes
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleetkube-e2e --test cluster_up
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleetkube_provisioner::runtime::MockOpKind;
use fleetkube_provisioner::{
    CertificateName, ClusterSpec, FileStateStore, MockFleet, Pipeline, ProvisionError, Stage,
    StateStore, X509Pki,
};
use tokio_util::sync::CancellationToken;

const SINGLE_NODE: &str = r#"
hosts:
  - address: 10.0.0.5
    hostname: node-1
    user: ubuntu
    roles: [etcd, controlplane, worker]
services:
  etcd: { image: "quay.io/coreos/etcd:v3.5.9" }
  kube-api: { image: rancher/k8s:v1.8.3-rancher2 }
  kube-controller: { image: rancher/k8s:v1.8.3-rancher2 }
  scheduler: { image: rancher/k8s:v1.8.3-rancher2 }
  kubelet: { image: rancher/k8s:v1.8.3-rancher2 }
  kubeproxy: { image: rancher/k8s:v1.8.3-rancher2 }
"#;

const TWO_CONTROL_PLANES: &str = r#"
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

struct Workspace {
    _dir: tempfile::TempDir,
    cluster_file: PathBuf,
    state_file: PathBuf,
}

impl Workspace {
    fn new(cluster: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cluster_file = dir.path().join("cluster.yml");
        std::fs::write(&cluster_file, cluster).unwrap();
        let state_file = dir.path().join("cluster.state.yml");
        Self {
            _dir: dir,
            cluster_file,
            state_file,
        }
    }

    fn pipeline(&self, fleet: &MockFleet) -> Pipeline {
        Pipeline::new(
            Arc::new(fleet.clone()),
            Arc::new(FileStateStore::new(&self.state_file)),
            Arc::new(X509Pki),
        )
    }

    fn cluster_file(&self) -> &Path {
        &self.cluster_file
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_single_node_up() {
    init_tracing();
    let ws = Workspace::new(SINGLE_NODE);
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    let output = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &token)
        .await
        .unwrap();

    assert_eq!(output.api_url, "https://10.0.0.5:6443");
    assert!(output.ca_cert_pem.contains("-----BEGIN CERTIFICATE-----"));
    assert!(
        fleetkube_pki::verify_signed_by(&output.admin_cert_pem, &output.ca_cert_pem).unwrap()
    );

    let mut running: Vec<String> = fleet
        .containers("10.0.0.5")
        .into_iter()
        .filter(|c| c.running)
        .map(|c| c.spec.name)
        .collect();
    running.sort();
    assert_eq!(
        running,
        [
            "etcd",
            "kube-api",
            "kube-controller",
            "kube-proxy",
            "kubelet",
            "scheduler"
        ]
    );
    assert!(ws.state_file.exists());
    assert_eq!(fleet.open_handles(), 0);

    // Same file, same fleet: nothing to do.
    let before = fleet.mutation_count();
    let again = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &token)
        .await
        .unwrap();
    assert_eq!(fleet.mutation_count(), before);
    assert_eq!(again.ca_cert_pem, output.ca_cert_pem);
}

#[tokio::test]
async fn test_state_file_reloads_as_cluster_file() {
    init_tracing();
    let ws = Workspace::new(TWO_CONTROL_PLANES);
    let fleet = MockFleet::new();

    let output = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &CancellationToken::new())
        .await
        .unwrap();

    let reloaded = ClusterSpec::load(&ws.state_file).unwrap();
    assert_eq!(reloaded, ClusterSpec::load(ws.cluster_file()).unwrap());

    let state = FileStateStore::new(&ws.state_file)
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.certificates.ca().certificate, output.ca_cert_pem);
    for (name, pair) in state.certificates.iter() {
        if name.is_ca() {
            continue;
        }
        assert!(
            fleetkube_pki::verify_signed_by(&pair.certificate, &output.ca_cert_pem).unwrap(),
            "{name} not signed by the cluster CA"
        );
    }
    assert!(state
        .certificates
        .get(&CertificateName::ApiServer("10.0.0.6".to_string()))
        .is_some());
}

#[tokio::test]
async fn test_phases_run_in_order() {
    init_tracing();
    let ws = Workspace::new(TWO_CONTROL_PLANES);
    let fleet = MockFleet::new();

    ws.pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &CancellationToken::new())
        .await
        .unwrap();

    let creates: Vec<String> = fleet
        .operations()
        .into_iter()
        .filter(|op| op.kind == MockOpKind::Create)
        .map(|op| op.container)
        .collect();
    let position = |name: &str| creates.iter().rposition(|c| c == name).unwrap();
    let first = |name: &str| creates.iter().position(|c| c == name).unwrap();

    // Every credential write precedes every component.
    assert!(position("cert-deployer") < first("etcd"));
    assert!(position("etcd") < first("kube-api"));
    assert!(position("scheduler") < first("kubelet"));
    assert!(position("kube-controller") < first("kube-proxy"));
}

#[tokio::test]
async fn test_unreachable_host_stops_before_certificates() {
    init_tracing();
    let ws = Workspace::new(TWO_CONTROL_PLANES);
    let fleet = MockFleet::new();
    fleet.set_unreachable("10.0.0.6");

    let err = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Connectivity { .. }));
    assert_eq!(err.stage(), Stage::Tunnel);
    assert_eq!(err.host(), Some("10.0.0.6"));
    assert_eq!(fleet.mutation_count(), 0);
    assert_eq!(fleet.open_handles(), 0);
    assert!(!ws.state_file.exists());
}

#[tokio::test]
async fn test_ca_survives_a_changed_cluster() {
    init_tracing();
    let ws = Workspace::new(TWO_CONTROL_PLANES);
    let fleet = MockFleet::new();
    let token = CancellationToken::new();

    let first = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &token)
        .await
        .unwrap();

    let upgraded = TWO_CONTROL_PLANES.replace(
        "kube-api: { image: rancher/k8s:v1.8.3-rancher2 }",
        "kube-api: { image: rancher/k8s:v1.8.4-rancher1 }",
    );
    std::fs::write(ws.cluster_file(), upgraded).unwrap();

    let second = ws
        .pipeline(&fleet)
        .up_from_file(ws.cluster_file(), "x509", &token)
        .await
        .unwrap();

    assert_eq!(second.ca_cert_pem, first.ca_cert_pem);
    assert_eq!(second.admin_cert_pem, first.admin_cert_pem);
    assert_eq!(
        fleet.container("10.0.0.5", "kube-api").unwrap().spec.image,
        "rancher/k8s:v1.8.4-rancher1"
    );
}

#[tokio::test]
async fn test_missing_cluster_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = MockFleet::new();
    let pipeline = Pipeline::new(
        Arc::new(fleet.clone()),
        Arc::new(FileStateStore::new(dir.path().join("state.yml"))),
        Arc::new(X509Pki),
    );

    let err = pipeline
        .up_from_file(
            &dir.path().join("absent.yml"),
            "x509",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Config { .. }));
    assert_eq!(err.stage(), Stage::LoadSpec);
    assert!(fleet.dials().is_empty());
}
