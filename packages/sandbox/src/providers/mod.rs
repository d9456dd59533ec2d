// ABOUTME: Provider trait for the container engine backing sandboxes
// ABOUTME: Defines the capability interface for container, exec, log, image and network calls

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Log stream error: {0}")]
    LogStreamError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Container configuration handed to the engine at creation time
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: BTreeMap<String, String>,
    /// Raw `source:target[:mode]` bind strings
    pub binds: Vec<String>,
    pub mounts: Vec<VolumeMount>,
    pub ports: Vec<PortBinding>,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,

    // Security
    pub user: Option<String>,
    pub privileged: bool,
    pub cap_drop: Vec<String>,
    pub readonly_rootfs: bool,
    pub security_opt: Vec<String>,

    /// Network to attach to; engine default when unset
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String, // tcp or udp
}

/// Container runtime information
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub ip_address: Option<String>,
    pub ports: HashMap<u16, u16>, // container_port -> host_port
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerMetrics {
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Command to run inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
    /// Return as soon as the process is launched instead of collecting output
    pub detach: bool,
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

/// Execution result from running a command in a container
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// None for detached execs
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub timestamps: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            follow: true,
            since: None,
            timestamps: true,
        }
    }
}

/// Raw multiplexed log bytes in the engine wire format, in arbitrary chunks
pub type RawLogStream = BoxStream<'static, Result<Bytes>>;

/// Network to create for a sandbox
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    /// No route outside the host
    pub internal: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub subnets: Vec<String>,
}

/// Provider trait for the container engine
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the engine is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Create a container, pulling its image first when absent. Does not start it.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a running container; stopping a stopped container succeeds
    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn restart_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container; removing a missing container succeeds
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo>;

    async fn get_metrics(&self, container_id: &str) -> Result<ContainerMetrics>;

    async fn exec_command(&self, container_id: &str, request: ExecRequest) -> Result<ExecResult>;

    /// Open the multiplexed log channel of a container
    async fn stream_logs(
        &self,
        container_id: &str,
        options: LogStreamOptions,
    ) -> Result<RawLogStream>;

    async fn pull_image(&self, image: &str, force: bool) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create a network and return its name
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>>;

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>>;

    /// Remove a network; removing a missing network succeeds
    async fn remove_network(&self, name: &str) -> Result<()>;
}
