//! fleetctl - provision Kubernetes clusters onto Docker hosts
//!
//! Reads a cluster file, brings every component up over SSH and writes an
//! admin kubeconfig for the result.

use anyhow::Result;
use clap::Parser;
use fleetkube_provisioner::{LogFormat, ProvisionerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod commands;
mod error;
mod output;

use commands::Cli;

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };
    tracing_subscriber::registry().with(filter).with(layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = async {
        let config = ProvisionerConfig::from_env()?;
        let format = cli.log_format()?.unwrap_or(config.log_format);
        init_tracing(&config.log_level, format);
        cli.run(config).await
    }
    .await;

    if let Err(e) = result {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
