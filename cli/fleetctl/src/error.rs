//! Error display for the CLI.

use colored::Colorize;
use fleetkube_provisioner::ProvisionError;

fn hint(err: &ProvisionError) -> Option<&'static str> {
    match err {
        ProvisionError::Config { .. } => Some("Check the cluster file and FLEETKUBE_* settings."),
        ProvisionError::Connectivity { .. } => {
            Some("Check SSH access to the host and that its Docker daemon is running.")
        }
        ProvisionError::AuthSetup { .. } => {
            Some("Move the state file aside to regenerate every certificate.")
        }
        ProvisionError::Deployment { .. } => {
            Some("Containers already started were left running; re-run once the host is fixed.")
        }
        ProvisionError::Persist(_) => Some(
            "The cluster is running but its state was not saved. Re-run `fleetctl cluster up` to record it.",
        ),
        ProvisionError::Cancelled { .. } => None,
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(provision) = err.downcast_ref::<ProvisionError>() {
        eprintln!("  {} {}", "stage:".dimmed(), provision.stage());
        if let Some(host) = provision.host() {
            eprintln!("  {} {}", "host:".dimmed(), host);
        }
        if let Some(hint) = hint(provision) {
            eprintln!("\n{}", format!("Hint: {}", hint).yellow());
        }
    }
}
