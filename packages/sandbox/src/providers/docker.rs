// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to manage containers, execs, log streams, images and networks

use super::{
    ContainerConfig, ContainerInfo, ContainerMetrics, ContainerStatus, ExecRequest, ExecResult,
    LogStreamOptions, NetworkInfo, NetworkSpec, Provider, ProviderError, RawLogStream, Result,
};
use crate::demux::{encode_frame, LogStream};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        RestartContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, Ipam, IpamConfig, Mount, MountTypeEnum, PortBinding},
    network::{CreateNetworkOptions, ListNetworksOptions},
    Docker,
};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Label marking containers and networks owned by devbox
pub const MANAGED_LABEL: &str = "devbox.managed";

pub struct DockerProvider {
    client: Docker,
    /// Cache of successfully pulled images to avoid redundant pulls
    /// Key: image name (e.g., "ubuntu:22.04"), Value: timestamp when pulled
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    /// Create a new Docker provider with custom pull timeout
    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Connect through an explicit unix socket path
    pub fn with_socket(socket_path: &str, timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection and custom timeout
    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    /// Convert our config to bollard config
    fn to_bollard_config(config: &ContainerConfig) -> Result<Config<String>> {
        let memory_bytes = config
            .memory_mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
            .ok_or_else(|| {
                ProviderError::ContainerError(format!(
                    "Memory limit of {} MB is out of range",
                    config.memory_mb
                ))
            })?;

        let mut labels = config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.to_string()),
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let mounts: Vec<Mount> = config
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.host_path.clone()),
                target: Some(m.container_path.clone()),
                read_only: Some(m.readonly),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut host_config = HostConfig {
            binds: Some(config.binds.clone()),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            nano_cpus: Some((config.cpu_cores * 1_000_000_000.0) as i64),
            memory: Some(memory_bytes),
            privileged: Some(config.privileged),
            cap_drop: Some(config.cap_drop.clone()),
            readonly_rootfs: Some(config.readonly_rootfs),
            security_opt: Some(config.security_opt.clone()),
            network_mode: config.network.clone(),
            ..Default::default()
        };

        // Zero means no storage limit
        if config.storage_mb > 0 {
            host_config.storage_opt = Some(HashMap::from([(
                "size".to_string(),
                format!("{}M", config.storage_mb),
            )]));
        }

        Ok(Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            env: Some(env),
            user: config.user.clone(),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        })
    }

    /// Convert bollard container status to our status
    fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }

    fn container_error(container_id: &str, err: BollardError) -> ProviderError {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404, ..
            } => ProviderError::NotFound(container_id.to_string()),
            other => ProviderError::ContainerError(other.to_string()),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);
        let bollard_config = Self::to_bollard_config(config)?;

        // Ensure image exists
        if !self.image_exists(&config.image).await? {
            info!("Pulling image: {}", config.image);
            self.pull_image(&config.image, false).await?;
        }

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Container already started is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already running", container_id);
                Ok(())
            }
            Err(e) => Err(Self::container_error(container_id, e)),
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Container already stopped is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(Self::container_error(container_id, e)),
        }
    }

    async fn restart_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Restarting container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = RestartContainerOptions {
            t: timeout_secs as isize,
        };

        self.client
            .restart_container(container_id, Some(options))
            .await
            .map_err(|e| Self::container_error(container_id, e))
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true, // Remove volumes
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // Container already removed is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Self::container_error(container_id, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        let status = Self::convert_status(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let mut ports = HashMap::new();
        if let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
        {
            for (container_port_str, bindings) in port_map {
                let host_port = bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.as_ref())
                    .and_then(|p| p.parse::<u16>().ok());
                // Container port format: "3000/tcp"
                let container_port = container_port_str
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    ports.insert(container_port, host_port);
                }
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let started_at = state
            .started_at
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: inspect
                .name
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            ip_address: inspect
                .network_settings
                .and_then(|ns| ns.ip_address)
                .filter(|s| !s.is_empty()),
            ports,
            created_at,
            started_at,
        })
    }

    async fn get_metrics(&self, container_id: &str) -> Result<ContainerMetrics> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stats_stream = self.client.stats(container_id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => {
                let cpu_delta = stats
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
                let system_delta = stats
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

                let cpu_usage_percent = if system_delta > 0 && cpu_delta > 0 {
                    (cpu_delta as f64 / system_delta as f64)
                        * 100.0
                        * stats.cpu_stats.online_cpus.unwrap_or(1) as f64
                } else {
                    0.0
                };

                let memory_usage_mb = stats.memory_stats.usage.unwrap_or(0) / (1024 * 1024);
                let memory_limit_mb = stats.memory_stats.limit.unwrap_or(0) / (1024 * 1024);

                let (rx_bytes, tx_bytes) = stats
                    .networks
                    .map(|networks| {
                        (
                            networks.values().map(|n| n.rx_bytes).sum(),
                            networks.values().map(|n| n.tx_bytes).sum(),
                        )
                    })
                    .unwrap_or((0, 0));

                Ok(ContainerMetrics {
                    cpu_usage_percent,
                    memory_usage_mb,
                    memory_limit_mb,
                    network_rx_bytes: rx_bytes,
                    network_tx_bytes: tx_bytes,
                })
            }
            Some(Err(e)) => Err(Self::container_error(container_id, e)),
            None => Err(ProviderError::ContainerError(
                "Failed to get container stats".to_string(),
            )),
        }
    }

    async fn exec_command(&self, container_id: &str, request: ExecRequest) -> Result<ExecResult> {
        debug!(
            "Executing command in container {}: {:?} (detach: {})",
            container_id, request.command, request.detach
        );

        let env: Vec<String> = request
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(request.command.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            user: request.user.clone(),
            working_dir: request.working_dir.clone(),
            tty: Some(request.tty),
            attach_stdout: Some(!request.detach),
            attach_stderr: Some(!request.detach),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| Self::container_error(container_id, e))?;

        let start_options = StartExecOptions {
            detach: request.detach,
            tty: request.tty,
            ..Default::default()
        };

        let start_result = self
            .client
            .start_exec(&exec.id, Some(start_options))
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(ProviderError::ExecError(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Ok(ExecResult::default());
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exec_inspect.exit_code,
            stdout,
            stderr,
        })
    }

    async fn stream_logs(
        &self,
        container_id: &str,
        options: LogStreamOptions,
    ) -> Result<RawLogStream> {
        let logs_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: options.follow,
            since: options.since.map(|dt| dt.timestamp()).unwrap_or(0),
            timestamps: options.timestamps,
            ..Default::default()
        };

        let container_id = container_id.to_string();
        let logs = self.client.logs(&container_id, Some(logs_options));

        // bollard splits frames for us; hand them on in wire format so the
        // demultiplexer stays the one place that attributes streams
        let stream = logs.filter_map(move |result| {
            let container_id = container_id.clone();
            async move {
                match result {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(Bytes::from(encode_frame(LogStream::Stdout, &message))))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(Bytes::from(encode_frame(LogStream::Stderr, &message))))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(ProviderError::LogStreamError(format!(
                        "{}: {}",
                        container_id, e
                    )))),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn pull_image(&self, image: &str, force: bool) -> Result<()> {
        // Check cache first (unless force is true)
        if !force {
            let cached = self.image_cache.read().await.contains_key(image);
            if cached {
                debug!("Image {} found in cache, skipping pull", image);
                // Still verify it actually exists in Docker
                if self.image_exists(image).await? {
                    return Ok(());
                }
                // Image was deleted outside of devbox, remove from cache
                self.image_cache.write().await.remove(image);
                info!("Image {} was deleted, removing from cache", image);
            }
        }

        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        // Apply timeout to the entire pull operation
        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(ProviderError::ImageError(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(ProviderError::ImageError(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        info!(
            "Creating network {} ({}, internal: {})",
            spec.name, spec.subnet, spec.internal
        );

        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            internal: spec.internal,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.clone()),
                    gateway: Some(spec.gateway.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels,
            ..Default::default()
        };

        self.client
            .create_network(options)
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        Ok(spec.name.clone())
    }

    async fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        // The engine's name filter is a substring match
        Ok(self
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        Ok(networks
            .into_iter()
            .map(|n| NetworkInfo {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                subnets: n
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|c| c.subnet)
                    .collect(),
            })
            .collect())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        info!("Removing network: {}", name);

        match self.client.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Network {} already removed", name);
                Ok(())
            }
            Err(e) => Err(ProviderError::NetworkError(e.to_string())),
        }
    }
}
