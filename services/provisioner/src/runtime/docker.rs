//! Docker Engine API client.
//!
//! Talks to a Docker daemon through a local Unix socket. For remote hosts the
//! socket is the local end of an [`SshTunnel`](super::SshTunnel), which this
//! runtime owns and tears down on [`close`](ContainerRuntime::close).
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper::{body::Buf, Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, PortBinding, RestartPolicy, RuntimeError,
    SshTunnel,
};

/// Docker Engine client bound to one socket.
pub struct DockerRuntime {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    tunnel: Option<SshTunnel>,
}

impl DockerRuntime {
    /// Client for a local socket, e.g. `/var/run/docker.sock`.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
            tunnel: None,
        }
    }

    /// Client for the local end of an SSH tunnel. The tunnel closes with the runtime.
    pub fn over_tunnel(tunnel: SshTunnel) -> Self {
        Self {
            socket_path: tunnel.local_socket().to_path_buf(),
            client: Client::unix(),
            tunnel: Some(tunnel),
        }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        let (status, body) = self.send(Method::GET, "/_ping", None).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Unreachable(format!(
                "docker ping returned {}: {}",
                status, body
            )))
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (status, _) = self
            .send(Method::GET, &format!("/images/{}/json", image), None)
            .await?;
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message: format!("failed to inspect image {}", image),
            });
        }

        info!(image = %image, "Pulling image");
        let (status, body) = self
            .send(
                Method::POST,
                &format!("/images/create?fromImage={}", image),
                None,
            )
            .await?;
        if !status.is_success() {
            return Err(api_error(status, body));
        }

        // Pull failures arrive as an error object inside a 200 progress stream.
        for line in body.lines() {
            if let Ok(progress) = serde_json::from_str::<PullProgress>(line) {
                if let Some(message) = progress.error {
                    return Err(RuntimeError::Api {
                        status: status.as_u16(),
                        message: format!("pulling {}: {}", image, message),
                    });
                }
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, String), RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| RuntimeError::Other(format!("invalid request: {}", e)))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;
        let mut text = String::new();
        let mut reader = body.reader();
        std::io::Read::read_to_string(&mut reader, &mut text)?;

        Ok((status, text))
    }
}

fn api_error(status: StatusCode, body: String) -> RuntimeError {
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    error!(status = %status, message = %message, "Docker API error");
    RuntimeError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let (status, body) = self
            .send(Method::GET, &format!("/containers/{}/json", name), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(status, body));
        }

        let inspected: InspectResponse = serde_json::from_str(&body)?;
        Ok(Some(inspected.into_state(name)))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let body = serde_json::to_vec(&CreateRequest::from_spec(spec))?;
        let (status, response) = self
            .send(
                Method::POST,
                &format!("/containers/create?name={}", spec.name),
                Some(body),
            )
            .await?;
        if !status.is_success() {
            return Err(api_error(status, response));
        }
        let created: CreateResponse = serde_json::from_str(&response)?;

        self.start(&created.id).await?;
        info!(container = %spec.name, id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let (status, body) = self
            .send(Method::POST, &format!("/containers/{}/start", name), None)
            .await?;
        // 304: already running
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(api_error(status, body))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let (status, body) = self
            .send(
                Method::DELETE,
                &format!("/containers/{}?force=true&v=true", name),
                None,
            )
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(container = %name, "Container removed");
            Ok(())
        } else {
            Err(api_error(status, body))
        }
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let (status, body) = self
            .send(Method::POST, &format!("/containers/{}/wait", name), None)
            .await?;
        if !status.is_success() {
            return Err(api_error(status, body));
        }
        let waited: WaitResponse = serde_json::from_str(&body)?;
        Ok(waited.status_code)
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRequest {
    image: String,
    cmd: Vec<String>,
    env: Vec<String>,
    labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    exposed_ports: BTreeMap<String, EmptyObject>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct EmptyObject {}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    binds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid_mode: Option<String>,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    restart_policy: Option<RestartPolicyBody>,
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<HostPort>>>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestartPolicyBody {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostPort {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

impl CreateRequest {
    fn from_spec(spec: &ContainerSpec) -> Self {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = BTreeMap::new();
        for binding in &spec.port_bindings {
            exposed_ports.insert(binding.port_key(), EmptyObject {});
            port_bindings
                .entry(binding.port_key())
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(HostPort {
                    host_ip: binding.host_ip.clone(),
                    host_port: binding.host_port.to_string(),
                });
        }

        Self {
            image: spec.image.clone(),
            cmd: spec.command.clone(),
            env: spec.env.clone(),
            labels: spec.labels.clone(),
            exposed_ports,
            host_config: HostConfig {
                binds: Some(spec.binds.clone()),
                network_mode: spec.network_mode.clone(),
                pid_mode: spec.pid_mode.clone(),
                privileged: spec.privileged,
                restart_policy: Some(RestartPolicyBody {
                    name: spec.restart_policy.as_str().to_string(),
                }),
                port_bindings: Some(port_bindings),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    config: InspectConfig,
    #[serde(default)]
    host_config: HostConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

impl InspectResponse {
    /// Rebuild the spec as far as Docker reports it. Daemon-added defaults
    /// (image env, empty binds) mean this rarely hashes equal to the
    /// original, which is why the creating spec's hash is kept as a label.
    fn into_state(self, name: &str) -> ContainerState {
        let host = self.host_config;

        let restart_policy = match host.restart_policy.as_ref().map(|p| p.name.as_str()) {
            Some("always") => RestartPolicy::Always,
            _ => RestartPolicy::No,
        };

        let mut port_bindings = Vec::new();
        for (key, hosts) in host.port_bindings.unwrap_or_default() {
            let Some((port, protocol)) = key.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port.parse() else {
                continue;
            };
            for h in hosts.unwrap_or_default() {
                port_bindings.push(PortBinding {
                    container_port,
                    protocol: protocol.to_string(),
                    host_ip: h.host_ip,
                    host_port: h.host_port.parse().unwrap_or(0),
                });
            }
        }
        port_bindings.sort_by(|a, b| a.port_key().cmp(&b.port_key()));

        let network_mode = host.network_mode.filter(|m| m != "default");
        let pid_mode = host.pid_mode.filter(|m| !m.is_empty());

        ContainerState {
            id: self.id,
            spec: ContainerSpec {
                name: name.to_string(),
                image: self.config.image,
                command: self.config.cmd.unwrap_or_default(),
                env: self.config.env.unwrap_or_default(),
                binds: host.binds.unwrap_or_default(),
                network_mode,
                pid_mode,
                privileged: host.privileged,
                restart_policy,
                port_bindings,
                labels: self.config.labels.unwrap_or_default(),
            },
            running: self.state.running,
        }
    }
}
