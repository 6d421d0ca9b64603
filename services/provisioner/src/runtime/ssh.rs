//! SSH-forwarded Docker sockets.
//!
//! Each remote host's Docker socket is exposed locally by an `ssh -N -L`
//! child process. The child is killed when the tunnel is closed or dropped,
//! so an aborted run never leaves forwarding processes behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, Dialer, DockerRuntime, RuntimeError};
use crate::cluster::HostSpec;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running `ssh -L` forward of one host's Docker socket.
pub struct SshTunnel {
    host: String,
    local_socket: PathBuf,
    child: Mutex<Option<Child>>,
}

impl SshTunnel {
    /// Start forwarding and wait until the local socket appears.
    pub async fn open(
        ssh_binary: &str,
        host: &HostSpec,
        local_socket: PathBuf,
        timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        if local_socket.exists() {
            std::fs::remove_file(&local_socket)?;
        }

        let mut command = Command::new(ssh_binary);
        command
            .arg("-N")
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "StreamLocalBindUnlink=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg("-p")
            .arg(host.ssh_port.to_string());
        if let Some(key) = &host.ssh_key_path {
            command.arg("-i").arg(expand_home(key));
        }
        command
            .arg("-L")
            .arg(format!("{}:{}", local_socket.display(), host.docker_socket))
            .arg(format!("{}@{}", host.user, host.address))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %host.address, socket = %local_socket.display(), "Starting SSH tunnel");
        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::Channel(format!("failed to run {}: {}", ssh_binary, e)))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if local_socket.exists() {
                break;
            }
            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(RuntimeError::Channel(format!(
                    "ssh exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(RuntimeError::Channel(format!(
                    "timed out after {:?} waiting for tunnel to {}",
                    timeout, host.address
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        info!(host = %host.address, "SSH tunnel established");
        Ok(Self {
            host: host.address.clone(),
            local_socket,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn local_socket(&self) -> &Path {
        &self.local_socket
    }

    /// Stop forwarding. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(host = %self.host, error = %e, "Failed to stop SSH tunnel");
        }
        match std::fs::remove_file(&self.local_socket) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(host = %self.host, "SSH tunnel closed");
        Ok(())
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Local socket path for a host's tunnel. Unique per host and process.
fn socket_path(dir: &Path, host: &HostSpec) -> PathBuf {
    let sanitized: String = host
        .address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("{}-{}.sock", sanitized, std::process::id()))
}

/// Dials hosts by tunnelling their Docker socket over SSH.
#[derive(Debug, Clone)]
pub struct SshDialer {
    ssh_binary: String,
    tunnel_dir: PathBuf,
    timeout: Duration,
}

impl SshDialer {
    pub fn new(ssh_binary: impl Into<String>, tunnel_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            tunnel_dir,
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, host: &HostSpec) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
        tokio::fs::create_dir_all(&self.tunnel_dir).await?;

        let socket = socket_path(&self.tunnel_dir, host);
        let tunnel = SshTunnel::open(&self.ssh_binary, host, socket, self.timeout).await?;
        let runtime = DockerRuntime::over_tunnel(tunnel);

        let ping = tokio::time::timeout(self.timeout, runtime.ping()).await;
        let result = match ping {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Unreachable(format!(
                "docker daemon on {} did not answer within {:?}",
                host.address, self.timeout
            ))),
        };
        if let Err(e) = result {
            let _ = runtime.close().await;
            return Err(e);
        }

        Ok(Box::new(runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Role;

    fn host(address: &str) -> HostSpec {
        HostSpec {
            address: address.to_string(),
            hostname: "node-1".to_string(),
            advertise_address: address.to_string(),
            user: "root".to_string(),
            ssh_port: 22,
            ssh_key_path: None,
            docker_socket: "/var/run/docker.sock".to_string(),
            roles: [Role::Etcd].into_iter().collect(),
        }
    }

    #[test]
    fn test_socket_path_is_sanitized() {
        let path = socket_path(Path::new("/tmp/t"), &host("fd00::5"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("fd00__5-"));
        assert!(name.ends_with(".sock"));
    }

    #[tokio::test]
    async fn test_failed_ssh_is_channel_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("t.sock");
        let result = SshTunnel::open("false", &host("10.0.0.5"), socket, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RuntimeError::Channel(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_channel_error() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = SshDialer::new(
            "/nonexistent/ssh",
            dir.path().to_path_buf(),
            Duration::from_secs(1),
        );
        assert!(dialer.dial(&host("10.0.0.5")).await.is_err());
    }
}
