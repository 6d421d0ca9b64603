//! CLI commands.

mod cluster;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetkube_provisioner::{LogFormat, ProvisionerConfig};

/// fleetctl - provision Kubernetes clusters onto Docker hosts.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log format (text or json). Overrides FLEETKUBE_LOG_FORMAT.
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision and update clusters.
    Cluster(cluster::ClusterCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// The log format requested on the command line, if any.
    pub fn log_format(&self) -> Result<Option<LogFormat>> {
        Ok(self.log_format.as_deref().map(str::parse::<LogFormat>).transpose()?)
    }

    /// Run the CLI command.
    pub async fn run(self, config: ProvisionerConfig) -> Result<()> {
        match self.command {
            Commands::Cluster(cmd) => cmd.run(config).await,
            Commands::Version => {
                println!("fleetctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}
