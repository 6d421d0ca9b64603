//! Cluster commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use fleetkube_provisioner::{
    write_atomic, DiscoveryStrategy, FileStateStore, Pipeline, ProvisionerConfig, SshDialer,
    X509Pki,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output::UpSummary;

/// Cluster command.
#[derive(Debug, Args)]
pub struct ClusterCommand {
    #[command(subcommand)]
    command: ClusterCommands,
}

#[derive(Debug, Subcommand)]
enum ClusterCommands {
    /// Bring a cluster up, or converge an existing one to its cluster file.
    Up(UpArgs),
}

#[derive(Debug, Args)]
struct UpArgs {
    /// Cluster file describing hosts and services.
    #[arg(long, env = "CLUSTER_FILE", default_value = "cluster.yml")]
    cluster_file: PathBuf,

    /// Authentication mode.
    #[arg(long, env = "AUTH_TYPE", default_value = "x509")]
    auth_type: String,

    /// State file (defaults to `<cluster-file-stem>.state.yml` beside the cluster file).
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Where to write the admin kubeconfig (defaults to `kube_config_<cluster-file>`).
    #[arg(long)]
    kubeconfig_out: Option<PathBuf>,

    /// Ignore saved state and issue a new CA.
    #[arg(long)]
    fresh: bool,
}

impl ClusterCommand {
    pub async fn run(self, config: ProvisionerConfig) -> Result<()> {
        match self.command {
            ClusterCommands::Up(args) => up(args, config).await,
        }
    }
}

/// `kube_config_<name>` next to the cluster file.
fn kubeconfig_path_for(cluster_file: &Path) -> PathBuf {
    let name = cluster_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("cluster.yml");
    cluster_file.with_file_name(format!("kube_config_{}", name))
}

async fn up(args: UpArgs, mut config: ProvisionerConfig) -> Result<()> {
    if args.state_file.is_some() {
        config.state_file = args.state_file.clone();
    }
    if args.fresh {
        config.discovery = DiscoveryStrategy::Fresh;
    }
    let state_path = config.state_file_for(&args.cluster_file);

    let dialer = SshDialer::new(
        config.ssh_binary.clone(),
        config.tunnel_dir.clone(),
        config.dial_timeout,
    );
    let pipeline = Pipeline::new(
        Arc::new(dialer),
        Arc::new(FileStateStore::new(&state_path)),
        Arc::new(X509Pki),
    )
    .with_discovery(config.discovery);

    let token = CancellationToken::new();
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after in-flight host operations");
                token.cancel();
            }
        })
    };

    let result = pipeline
        .up_from_file(&args.cluster_file, &args.auth_type, &token)
        .await;
    ctrl_c.abort();
    let output = result?;

    let kubeconfig_path = args
        .kubeconfig_out
        .unwrap_or_else(|| kubeconfig_path_for(&args.cluster_file));
    let kubeconfig = output.admin_kubeconfig()?;
    write_atomic(&kubeconfig_path, kubeconfig.as_bytes())
        .with_context(|| format!("cannot write {}", kubeconfig_path.display()))?;

    UpSummary {
        api_url: &output.api_url,
        kubeconfig: &kubeconfig_path,
        state_file: &state_path,
    }
    .print();
    Ok(())
}
