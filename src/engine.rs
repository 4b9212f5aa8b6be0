//! Container engine interface and its Docker implementation
//!
//! The orchestration core only ever talks to the engine through the
//! [`ContainerEngine`] trait; the Docker implementation lives here and the
//! tests substitute their own. Workspace containers are labelled with the
//! owning user so list and prune calls never touch foreign containers.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Label carrying the owning user on every workspace container.
pub const USER_LABEL: &str = "io.worldhub.user";

/// Port workspace images listen on inside the container.
pub const WORKSPACE_PORT: u16 = 8000;

/// Failures reported by the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused to create or start the container
    #[error("engine rejected container: {0}")]
    Rejected(String),

    /// The container does not exist
    #[error("no such container: {0}")]
    NotFound(String),

    /// The engine daemon is unreachable
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine error: {0}")]
    Other(String),
}

/// Everything needed to create and start one workspace container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; the owning user identity
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    /// Bind specification, `volume:/target`
    pub volume_bind: String,
    /// Host port mapped to [`WORKSPACE_PORT`]
    pub host_port: u16,
}

/// Network location reported by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAddress {
    pub address: String,
    pub port: u16,
}

/// One gateway-owned container as reported by the engine.
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    /// Owning user, from the container label
    pub user: String,
    pub running: bool,
    pub host_port: Option<u16>,
}

/// Narrow interface the core consumes the container engine through.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create and start a container, returning its engine identity.
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, EngineError>;

    /// Report where a container is reachable on the host.
    async fn inspect(&self, container_id: &str) -> Result<ContainerAddress, EngineError>;

    /// Stop a container. Already-stopped and not-found are success.
    async fn stop(&self, container_id: &str) -> Result<(), EngineError>;

    /// Remove a container. Not-found is success.
    async fn remove(&self, container_id: &str) -> Result<(), EngineError>;

    /// List all gateway-labelled containers, running or not.
    async fn list(&self) -> Result<Vec<EngineContainer>, EngineError>;

    /// Prune stopped gateway-labelled containers, returning removed ids.
    async fn prune(&self) -> Result<Vec<String>, EngineError>;
}

/// Docker implementation over the bollard client.
pub struct DockerEngine {
    client: Docker,
    stop_grace: Duration,
}

impl DockerEngine {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority: explicit host, then the DOCKER_HOST
    /// environment variable, then the platform default socket. The
    /// connection is verified with a ping before use.
    pub async fn connect(docker_host: Option<&str>, stop_grace: Duration) -> anyhow::Result<Self> {
        let client = match docker_host.map(str::to_owned).or_else(|| std::env::var("DOCKER_HOST").ok())
        {
            Some(host) => Self::connect_to_host(&host)?,
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker socket: {}", e))?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running or set DOCKER_HOST.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, stop_grace })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        // A crashed gateway can leave a same-named container behind;
        // remove it so the create does not hit a name conflict.
        let _ = self.remove(&spec.name).await;

        let port_key = format!("{}/tcp", WORKSPACE_PORT);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            binds: Some(vec![spec.volume_bind.clone()]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(USER_LABEL.to_string(), spec.name.clone());

        let container_config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated")
                    || err_str.contains("address already in use")
                {
                    EngineError::Rejected(format!(
                        "host port {} is already in use",
                        spec.host_port
                    ))
                } else if err_str.contains("No such image") {
                    EngineError::Rejected(format!("image '{}' not found locally", spec.image))
                } else {
                    EngineError::Rejected(format!(
                        "create failed for '{}' (image {}): {}",
                        spec.name, spec.image, e
                    ))
                }
            })?;

        let container_id = response.id;
        info!(
            name = %spec.name,
            container_id,
            image = %spec.image,
            host_port = spec.host_port,
            "Created workspace container"
        );

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                EngineError::Rejected(format!(
                    "start failed for '{}' (id {}): {}",
                    spec.name, container_id, e
                ))
            })?;

        info!(name = %spec.name, container_id, "Started workspace container");
        Ok(container_id)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerAddress, EngineError> {
        let response = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::NotFound(container_id.to_string()),
                other => EngineError::Other(other.to_string()),
            })?;

        let port_key = format!("{}/tcp", WORKSPACE_PORT);
        let host_port = response
            .network_settings
            .and_then(|net| net.ports)
            .and_then(|ports| ports.get(&port_key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| {
                EngineError::Other(format!(
                    "container {} has no host binding for {}",
                    container_id, port_key
                ))
            })?;

        Ok(ContainerAddress {
            address: "127.0.0.1".to_string(),
            port: host_port,
        })
    }

    async fn stop(&self, container_id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: self.stop_grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped workspace container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found on stop");
                Ok(())
            }
            Err(e) => Err(EngineError::Other(format!("stop failed: {}", e))),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed workspace container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found on remove");
                Ok(())
            }
            Err(e) => Err(EngineError::Other(format!("remove failed: {}", e))),
        }
    }

    async fn list(&self) -> Result<Vec<EngineContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![USER_LABEL.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Other(format!("list failed: {}", e)))?;

        let mut result = Vec::with_capacity(containers.len());
        for summary in containers {
            let Some(id) = summary.id else { continue };
            let Some(user) = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(USER_LABEL).cloned())
            else {
                continue;
            };

            let running = summary.state.as_deref() == Some("running");
            let host_port = summary
                .ports
                .as_ref()
                .and_then(|ports| ports.iter().find_map(|p| p.public_port));

            result.push(EngineContainer {
                id,
                user,
                running,
                host_port,
            });
        }

        Ok(result)
    }

    async fn prune(&self) -> Result<Vec<String>, EngineError> {
        let until = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| EngineError::Other(format!("clock error: {}", e)))?
            .as_secs();

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![USER_LABEL.to_string()]);
        filters.insert("until".to_string(), vec![until.to_string()]);

        let options = PruneContainersOptions { filters };

        let response = self
            .client
            .prune_containers(Some(options))
            .await
            .map_err(|e| EngineError::Other(format!("prune failed: {}", e)))?;

        let removed = response.containers_deleted.unwrap_or_default();
        if !removed.is_empty() {
            warn!(count = removed.len(), "Pruned stopped workspace containers");
        }

        Ok(removed)
    }
}
