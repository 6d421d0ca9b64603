//! Persisted cluster state.
//!
//! After a successful run the spec that was applied and the certificate
//! bundle that was distributed are written to a single YAML document. The
//! next run reads it back to reuse the CA and unchanged leaves.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::CertificateBundle;
use crate::cluster::{ClusterSpec, ConfigError};
use crate::config::DiscoveryStrategy;

/// What a previous successful run left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(flatten)]
    pub spec: ClusterSpec,
    pub certificates: CertificateBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn new(spec: ClusterSpec, certificates: CertificateBundle) -> Self {
        Self {
            spec,
            certificates,
            generated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cannot serialize cluster state: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state write task failed: {0}")]
    Task(String),
}

/// Where cluster state lives between runs.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The previous state, or `None` when there is none.
    async fn load(&self) -> Result<Option<ClusterState>, ConfigError>;

    async fn save(&self, state: &ClusterState) -> Result<(), PersistError>;
}

/// A YAML state file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> ConfigError {
        ConfigError::InvalidState {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<ClusterState>, ConfigError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state: ClusterState = serde_yaml::from_str(&contents).map_err(|e| self.invalid(e))?;
        state.spec.validate().map_err(|e| self.invalid(e))?;

        info!(
            path = %self.path.display(),
            hosts = state.spec.hosts.len(),
            certificates = state.certificates.len(),
            "Loaded cluster state"
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &ClusterState) -> Result<(), PersistError> {
        let contents = serde_yaml::to_string(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, contents.as_bytes()))
            .await
            .map_err(|e| PersistError::Task(e.to_string()))??;

        info!(path = %self.path.display(), "Saved cluster state");
        Ok(())
    }
}

/// Replace `path` with `contents` so readers see the old or the new file,
/// never a partial one. The file is readable by its owner only.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistError> {
    let failed = |source: std::io::Error| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(failed)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let written = options.open(&tmp_path).and_then(|mut file: File| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(failed(e));
    }

    fs::rename(&tmp_path, path).map_err(failed)
}

/// Find the previous run's state according to `strategy`.
pub async fn discover(
    strategy: DiscoveryStrategy,
    store: &dyn StateStore,
) -> Result<Option<ClusterState>, ConfigError> {
    match strategy {
        DiscoveryStrategy::Fresh => {
            info!("Fresh install requested; ignoring any saved state");
            Ok(None)
        }
        DiscoveryStrategy::Persisted => {
            let state = store.load().await?;
            if state.is_none() {
                warn!("No saved cluster state; treating this as a fresh install");
            }
            Ok(state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{required_certificates, PkiService, X509Pki};
    use crate::services::tests::{cluster, context};

    fn state() -> ClusterState {
        let spec = cluster();
        let network = context(&spec).network;
        let bundle = X509Pki
            .generate_or_reuse(&required_certificates(&spec, &network), None)
            .unwrap();
        ClusterState::new(spec, bundle)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("cluster.state.yml"));
        let saved = state();

        store.save(&saved).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved);

        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(names.len(), 1, "temp file left behind");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yml");
        FileStateStore::new(&path).save(&state()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_state_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yml");
        FileStateStore::new(&path).save(&state()).await.unwrap();

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(doc.get("hosts").is_some());
        assert!(doc.get("services").is_some());
        assert!(doc["certificates"].get("kube-ca").is_some());
        assert!(doc["certificates"].get("kube-apiserver@10.0.0.6").is_some());
        assert!(doc.get("generated_at").is_some());

        // The state file is also a valid cluster document.
        let spec = ClusterSpec::load(&path).unwrap();
        assert_eq!(spec, cluster());
    }

    #[tokio::test]
    async fn test_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("absent.yml"));
        assert!(store.load().await.unwrap().is_none());
        assert!(discover(DiscoveryStrategy::Persisted, &store)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yml");
        std::fs::write(&path, "hosts: [\n").unwrap();

        let err = FileStateStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_fresh_strategy_ignores_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.yml"));
        store.save(&state()).await.unwrap();

        assert!(discover(DiscoveryStrategy::Fresh, &store)
            .await
            .unwrap()
            .is_none());
        assert!(discover(DiscoveryStrategy::Persisted, &store)
            .await
            .unwrap()
            .is_some());
    }
}
