//! fleetkube provisioner library
//!
//! Brings up a Kubernetes control plane on a set of Docker hosts from a
//! declarative cluster document, and keeps re-runs cheap: an unchanged
//! cluster converges without touching a single container.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline::up
//! ├── cluster     (load + validate the document)
//! ├── hosts       (one runtime channel per host; SSH tunnel to Docker)
//! ├── state       (previous run's spec and certificates)
//! ├── auth        (CA + leaf certificates, reused where possible)
//! ├── prepare     (cert-deployer writes credentials on each host)
//! ├── deploy      (etcd → controlplane → worker, per-host fan-out)
//! └── state       (atomic write of the applied state)
//! ```
//!
//! ## Modules
//!
//! - `runtime`: container runtime boundary, Docker and in-memory backends
//! - `services`: container specs for each cluster component
//! - `pipeline`: the stage sequence tying everything together

pub mod auth;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod error;
pub mod hosts;
pub mod kubeconfig;
pub mod paths;
pub mod pipeline;
pub mod prepare;
pub mod runtime;
pub mod services;
pub mod state;

mod fanout;

// Re-export commonly used types
pub use auth::{AuthType, CertificateBundle, CertificateName, PkiService, X509Pki};
pub use cluster::{ClusterSpec, ConfigError, HostSpec, Role};
pub use config::{DiscoveryStrategy, LogFormat, ProvisionerConfig};
pub use error::{ProvisionError, Stage};
pub use pipeline::{ClusterUpOutput, Pipeline};
pub use runtime::{MockFleet, SshDialer};
pub use state::{write_atomic, ClusterState, FileStateStore, StateStore};
