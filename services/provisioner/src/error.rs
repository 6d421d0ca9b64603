//! Pipeline error taxonomy.
//!
//! Every stage failure surfaces as exactly one [`ProvisionError`] variant so
//! callers can tell a bad document from an unreachable host, a failed
//! deployment, or a state file that could not be written.

use thiserror::Error;

use crate::auth::AuthError;
use crate::cluster::{ConfigError, Role};
use crate::runtime::RuntimeError;
use crate::state::PersistError;

/// A pipeline stage, used for error reporting and span names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadSpec,
    Tunnel,
    Discover,
    Authenticate,
    PrepareHosts,
    Deploy(Role),
    Persist,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::LoadSpec => f.write_str("load-spec"),
            Stage::Tunnel => f.write_str("tunnel"),
            Stage::Discover => f.write_str("discover"),
            Stage::Authenticate => f.write_str("authenticate"),
            Stage::PrepareHosts => f.write_str("prepare-hosts"),
            Stage::Deploy(role) => write!(f, "deploy-{}", role),
            Stage::Persist => f.write_str("persist"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("configuration error: {source}")]
    Config {
        stage: Stage,
        #[source]
        source: ConfigError,
    },

    #[error("cannot reach host {host}: {source}")]
    Connectivity {
        host: String,
        #[source]
        source: RuntimeError,
    },

    #[error("authentication setup failed: {source}")]
    AuthSetup {
        stage: Stage,
        #[source]
        source: AuthError,
    },

    #[error("{component} on host {host} failed: {cause}")]
    Deployment {
        stage: Stage,
        host: String,
        component: String,
        #[source]
        cause: RuntimeError,
    },

    /// The cluster is up but its state was not recorded.
    #[error("cluster is running but its state could not be saved: {0}")]
    Persist(#[from] PersistError),

    #[error("run cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl From<ConfigError> for ProvisionError {
    fn from(source: ConfigError) -> Self {
        ProvisionError::Config {
            stage: Stage::LoadSpec,
            source,
        }
    }
}

impl From<AuthError> for ProvisionError {
    fn from(source: AuthError) -> Self {
        ProvisionError::AuthSetup {
            stage: Stage::Authenticate,
            source,
        }
    }
}

impl ProvisionError {
    /// The stage that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            ProvisionError::Config { stage, .. } => *stage,
            ProvisionError::Connectivity { .. } => Stage::Tunnel,
            ProvisionError::AuthSetup { stage, .. } => *stage,
            ProvisionError::Deployment { stage, .. } => *stage,
            ProvisionError::Persist(_) => Stage::Persist,
            ProvisionError::Cancelled { stage } => *stage,
        }
    }

    /// Attribute a configuration or credential error to the stage it
    /// surfaced in. Other variants already carry their stage.
    pub fn at_stage(self, at: Stage) -> Self {
        match self {
            ProvisionError::Config { source, .. } => ProvisionError::Config { stage: at, source },
            ProvisionError::AuthSetup { source, .. } => {
                ProvisionError::AuthSetup { stage: at, source }
            }
            other => other,
        }
    }

    /// The host the error is attributed to, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            ProvisionError::Connectivity { host, .. } | ProvisionError::Deployment { host, .. } => {
                Some(host.as_str())
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionError::Cancelled { .. })
    }
}
