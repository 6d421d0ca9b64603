//! Terminal output for `fleetctl`.

use std::path::Path;

use colored::Colorize;

/// What `cluster up` reports once the cluster is converged.
pub struct UpSummary<'a> {
    pub api_url: &'a str,
    pub kubeconfig: &'a Path,
    pub state_file: &'a Path,
}

impl UpSummary<'_> {
    /// Labelled detail lines, aligned on the value column.
    fn details(&self) -> Vec<String> {
        let rows = [
            ("API server", self.api_url.to_string()),
            ("Kubeconfig", self.kubeconfig.display().to_string()),
            ("State file", self.state_file.display().to_string()),
        ];
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        rows.iter()
            .map(|(label, value)| format!("  {:<width$}  {}", label, value, width = width))
            .collect()
    }

    pub fn print(&self) {
        println!("{} cluster is up", "✓".green().bold());
        for line in self.details() {
            println!("{}", line);
        }
    }
}
