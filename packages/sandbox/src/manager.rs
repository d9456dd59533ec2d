// ABOUTME: Sandbox lifecycle orchestrator driving the container engine and persisted state
// ABOUTME: Serializes transitions per sandbox, enforces the security policy and cleans up on delete

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::error::{Result, SandboxError};
use crate::log_store::LogStore;
use crate::network::{self, CleanupOutcome};
use crate::policy::{self, SecurityPolicy};
use crate::providers::{
    ContainerConfig, ContainerInfo, ContainerMetrics, ExecRequest, ExecResult, PortBinding,
    Provider,
};
use crate::sessions::kill_session_process;
use crate::storage::{EnvVar, PortMapping, Sandbox, SandboxStatus, SandboxStorage};
use crate::streaming::LogStreamer;

pub const DEFAULT_CPU_CORES: f64 = 2.0;
pub const DEFAULT_MEMORY_MB: u64 = 2048;
pub const DEFAULT_STORAGE_MB: u64 = 10240;

/// Working directory of every sandbox container
pub const WORKSPACE_DIR: &str = "/workspace";

/// Default capacity for the sandbox event channel
const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

/// Request to create a new sandbox
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    pub project_id: String,
    pub name: String,
    pub image: String,
    pub cpu_cores: Option<f64>,
    pub memory_mb: Option<u64>,
    pub storage_mb: Option<u64>,
    pub ports: Vec<PortBinding>,
    pub env_vars: BTreeMap<String, String>,
}

/// Lifecycle status change published to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxEvent {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub error_message: Option<String>,
}

/// Outcome of a port or environment change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigChange {
    /// The sandbox is running and only picks the change up after a restart
    pub restart_required: bool,
}

/// What a delete did with each best-effort cleanup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub sandbox_id: String,
    pub container: CleanupOutcome,
    pub network: CleanupOutcome,
    pub sessions_terminated: usize,
    pub logs_removed: u64,
}

pub struct SandboxManager {
    storage: Arc<SandboxStorage>,
    logs: Arc<LogStore>,
    provider: Arc<dyn Provider>,
    policy: SecurityPolicy,
    stop_timeout_secs: u64,
    /// One lock per sandbox; transitions on the same sandbox never overlap
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closing: AtomicBool,
    event_tx: broadcast::Sender<SandboxEvent>,
    /// Released on delete so nothing keeps streaming for a removed record
    streamer: Option<Arc<LogStreamer>>,
}

impl SandboxManager {
    pub fn new(
        storage: Arc<SandboxStorage>,
        logs: Arc<LogStore>,
        provider: Arc<dyn Provider>,
        policy: SecurityPolicy,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_SIZE);

        Self {
            storage,
            logs,
            provider,
            policy,
            stop_timeout_secs: 10,
            locks: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            event_tx,
            streamer: None,
        }
    }

    pub fn with_log_streamer(mut self, streamer: Arc<LogStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_stop_timeout(mut self, timeout_secs: u64) -> Self {
        self.stop_timeout_secs = timeout_secs;
        self
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// Subscribe to lifecycle status changes
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // RECORDS
    // ========================================================================

    /// Persist a new stopped sandbox. The engine is not touched until start.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        self.ensure_open()?;

        let cpu_cores = request.cpu_cores.unwrap_or(DEFAULT_CPU_CORES);
        let memory_mb = request.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        let storage_mb = request.storage_mb.unwrap_or(DEFAULT_STORAGE_MB);

        if request.image.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "Image must not be empty".to_string(),
            ));
        }
        if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
            return Err(SandboxError::InvalidRequest(format!(
                "cpu_cores must be a positive number, got {}",
                cpu_cores
            )));
        }
        if memory_mb == 0 || storage_mb == 0 {
            return Err(SandboxError::InvalidRequest(
                "memory_mb and storage_mb must be greater than zero".to_string(),
            ));
        }

        let now = Utc::now();
        let mut ports = Vec::with_capacity(request.ports.len());
        for port in &request.ports {
            validate_port(port)?;
            ports.push(PortMapping {
                id: None,
                sandbox_id: String::new(),
                container_port: port.container_port,
                host_port: port.host_port,
                protocol: port.protocol.clone(),
                created_at: now,
            });
        }

        let env_vars = request
            .env_vars
            .iter()
            .map(|(key, value)| {
                validate_env_key(key)?;
                Ok(EnvVar {
                    id: None,
                    sandbox_id: String::new(),
                    key: key.clone(),
                    value: value.clone(),
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let sandbox = Sandbox {
            id: String::new(),
            project_id: request.project_id,
            name: request.name,
            image: request.image,
            cpu_cores,
            memory_mb,
            storage_mb,
            container_id: None,
            status: SandboxStatus::Stopped,
            error_message: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
        };

        let sandbox = self
            .storage
            .create_sandbox(sandbox, ports, env_vars)
            .await?;
        info!("Created sandbox {} ({})", sandbox.id, sandbox.image);
        Ok(sandbox)
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        Ok(self.storage.get_sandbox(sandbox_id).await?)
    }

    pub async fn list_sandboxes(
        &self,
        project_id: Option<&str>,
        status: Option<SandboxStatus>,
    ) -> Result<Vec<Sandbox>> {
        Ok(self.storage.list_sandboxes(project_id, status).await?)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Start a sandbox, creating its container on first start
    pub async fn start_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let _guard = self.lock_sandbox(sandbox_id).await?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        self.start_locked(sandbox).await
    }

    /// Stop a sandbox. Stopping a stopped sandbox is a no-op.
    pub async fn stop_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let _guard = self.lock_sandbox(sandbox_id).await?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;

        if sandbox.status == SandboxStatus::Stopped {
            return Ok(sandbox);
        }

        let Some(container_id) = sandbox.container_id.clone() else {
            // Nothing was ever created, so there is nothing to stop
            self.set_status(sandbox_id, SandboxStatus::Stopped, None)
                .await?;
            return Ok(self.storage.get_sandbox(sandbox_id).await?);
        };

        self.set_status(sandbox_id, SandboxStatus::Stopping, None)
            .await?;

        match self
            .provider
            .stop_container(&container_id, self.stop_timeout_secs)
            .await
        {
            Ok(()) => {
                self.set_status(sandbox_id, SandboxStatus::Stopped, None)
                    .await?;
                info!("Stopped sandbox {}", sandbox_id);
                Ok(self.storage.get_sandbox(sandbox_id).await?)
            }
            Err(e) => Err(self.fail(sandbox_id, e.into()).await),
        }
    }

    /// Restart a sandbox's container. Without a container this is a start.
    pub async fn restart_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let _guard = self.lock_sandbox(sandbox_id).await?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;

        let Some(container_id) = sandbox.container_id.clone() else {
            return self.start_locked(sandbox).await;
        };

        self.set_status(sandbox_id, SandboxStatus::Starting, None)
            .await?;

        match self
            .provider
            .restart_container(&container_id, self.stop_timeout_secs)
            .await
        {
            Ok(()) => {
                self.set_status(sandbox_id, SandboxStatus::Running, None)
                    .await?;
                info!("Restarted sandbox {}", sandbox_id);
                Ok(self.storage.get_sandbox(sandbox_id).await?)
            }
            Err(e) => Err(self.fail(sandbox_id, e.into()).await),
        }
    }

    /// Delete a sandbox from any state.
    ///
    /// Session, container and network cleanup are best-effort and reported, never raised.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<DeleteReport> {
        let guard = self.lock_sandbox(sandbox_id).await?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;

        let mut sessions_terminated = 0;
        for session in self.storage.list_sessions(sandbox_id, false).await? {
            if self.storage.terminate_session(&session.id).await? {
                kill_session_process(self.provider.as_ref(), &sandbox, &session).await;
                sessions_terminated += 1;
            }
        }

        // Stop the pump before the log purge so its final flush is purged too
        if let Some(streamer) = &self.streamer {
            streamer.release_sandbox(sandbox_id).await;
        }

        let container = match &sandbox.container_id {
            Some(container_id) => self.cleanup_container(container_id).await,
            None => CleanupOutcome::Skipped,
        };

        let logs_removed = self.logs.clear_logs(sandbox_id).await?;
        self.storage.delete_sandbox(sandbox_id).await?;

        let network = network::remove_isolated_network(self.provider.as_ref(), sandbox_id).await;

        drop(guard);
        self.locks.lock().await.remove(sandbox_id);

        info!(
            "Deleted sandbox {} (container: {:?}, network: {:?}, sessions: {}, logs: {})",
            sandbox_id, container, network, sessions_terminated, logs_removed
        );

        Ok(DeleteReport {
            sandbox_id: sandbox_id.to_string(),
            container,
            network,
            sessions_terminated,
            logs_removed,
        })
    }

    // ========================================================================
    // PORTS AND ENVIRONMENT
    // ========================================================================

    pub async fn add_port_mapping(
        &self,
        sandbox_id: &str,
        port: PortBinding,
    ) -> Result<ConfigChange> {
        validate_port(&port)?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;

        self.storage
            .add_port_mapping(PortMapping {
                id: None,
                sandbox_id: sandbox_id.to_string(),
                container_port: port.container_port,
                host_port: port.host_port,
                protocol: port.protocol,
                created_at: Utc::now(),
            })
            .await?;

        Ok(config_change(&sandbox))
    }

    pub async fn remove_port_mapping(
        &self,
        sandbox_id: &str,
        container_port: u16,
    ) -> Result<ConfigChange> {
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        self.storage
            .remove_port_mapping(sandbox_id, container_port)
            .await?;
        Ok(config_change(&sandbox))
    }

    pub async fn list_port_mappings(&self, sandbox_id: &str) -> Result<Vec<PortMapping>> {
        self.storage.get_sandbox(sandbox_id).await?;
        Ok(self.storage.list_port_mappings(sandbox_id).await?)
    }

    /// Set an environment variable, replacing any previous value
    pub async fn set_env_var(
        &self,
        sandbox_id: &str,
        key: &str,
        value: &str,
    ) -> Result<ConfigChange> {
        validate_env_key(key)?;
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        self.storage.set_env_var(sandbox_id, key, value).await?;
        Ok(config_change(&sandbox))
    }

    pub async fn remove_env_var(&self, sandbox_id: &str, key: &str) -> Result<ConfigChange> {
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        self.storage.remove_env_var(sandbox_id, key).await?;
        Ok(config_change(&sandbox))
    }

    pub async fn list_env_vars(&self, sandbox_id: &str) -> Result<Vec<EnvVar>> {
        self.storage.get_sandbox(sandbox_id).await?;
        Ok(self.storage.list_env_vars(sandbox_id).await?)
    }

    // ========================================================================
    // CONTAINER ACCESS
    // ========================================================================

    /// Inspect the sandbox's container
    pub async fn container_info(&self, sandbox_id: &str) -> Result<ContainerInfo> {
        let container_id = self.container_id(sandbox_id).await?;
        Ok(self.provider.get_container_info(&container_id).await?)
    }

    /// One-shot resource usage of the sandbox's container
    pub async fn container_stats(&self, sandbox_id: &str) -> Result<ContainerMetrics> {
        let container_id = self.container_id(sandbox_id).await?;
        Ok(self.provider.get_metrics(&container_id).await?)
    }

    /// Run a command in a running sandbox
    pub async fn exec(&self, sandbox_id: &str, request: ExecRequest) -> Result<ExecResult> {
        if request.command.is_empty() {
            return Err(SandboxError::InvalidRequest(
                "Command must not be empty".to_string(),
            ));
        }

        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        let container_id = match (&sandbox.container_id, sandbox.status) {
            (Some(container_id), SandboxStatus::Running) => container_id.clone(),
            _ => {
                return Err(SandboxError::InvalidState(format!(
                    "Sandbox {} is {}, exec needs a running sandbox",
                    sandbox_id, sandbox.status
                )))
            }
        };

        let request = ExecRequest {
            working_dir: request.working_dir.or(Some(WORKSPACE_DIR.to_string())),
            ..request
        };
        Ok(self.provider.exec_command(&container_id, request).await?)
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Refuse new lifecycle operations and wait for in-flight ones to settle
    pub async fn drain(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let locks: Vec<Arc<Mutex<()>>> = self.locks.lock().await.values().cloned().collect();
        for lock in locks {
            let _settled = lock.lock().await;
        }

        info!("Sandbox manager drained");
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    // ==================== Private Helper Methods ====================

    fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            Err(SandboxError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn lock_sandbox(&self, sandbox_id: &str) -> Result<OwnedMutexGuard<()>> {
        self.ensure_open()?;

        let lock = self
            .locks
            .lock()
            .await
            .entry(sandbox_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        // Drain may have begun while this call was queued
        self.ensure_open()?;
        Ok(guard)
    }

    /// Start with the sandbox lock already held
    async fn start_locked(&self, sandbox: Sandbox) -> Result<Sandbox> {
        if sandbox.status == SandboxStatus::Running {
            return Err(SandboxError::InvalidState(format!(
                "Sandbox {} is already running",
                sandbox.id
            )));
        }

        self.set_status(&sandbox.id, SandboxStatus::Starting, None)
            .await?;

        match self.launch(&sandbox).await {
            Ok(()) => {
                self.set_status(&sandbox.id, SandboxStatus::Running, None)
                    .await?;
                info!("Started sandbox {}", sandbox.id);
                Ok(self.storage.get_sandbox(&sandbox.id).await?)
            }
            Err(e) => Err(self.fail(&sandbox.id, e).await),
        }
    }

    /// Create the container if needed, then start it
    async fn launch(&self, sandbox: &Sandbox) -> Result<()> {
        let container_id = match &sandbox.container_id {
            Some(container_id) => container_id.clone(),
            None => {
                let mut config = self.container_config(sandbox).await?;
                policy::harden(&mut config, &self.policy);
                policy::validate(&config, &self.policy)?;

                config.network = network::create_isolated_network(
                    self.provider.as_ref(),
                    &sandbox.id,
                    self.policy.network_isolation,
                )
                .await?;

                let container_id = self.provider.create_container(&config).await?;
                self.storage
                    .set_container_id(&sandbox.id, &container_id)
                    .await?;
                info!(
                    "Created container {} for sandbox {}",
                    container_id, sandbox.id
                );
                container_id
            }
        };

        self.provider.start_container(&container_id).await?;
        Ok(())
    }

    async fn container_config(&self, sandbox: &Sandbox) -> Result<ContainerConfig> {
        let ports = self
            .storage
            .list_port_mappings(&sandbox.id)
            .await?
            .into_iter()
            .map(|p| PortBinding {
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: p.protocol,
            })
            .collect();

        let env_vars = self
            .storage
            .list_env_vars(&sandbox.id)
            .await?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();

        let labels = HashMap::from([
            ("devbox.sandbox.id".to_string(), sandbox.id.clone()),
            ("devbox.project.id".to_string(), sandbox.project_id.clone()),
        ]);

        Ok(ContainerConfig {
            image: sandbox.image.clone(),
            name: container_name(&sandbox.id),
            env_vars,
            ports,
            cpu_cores: sandbox.cpu_cores,
            memory_mb: sandbox.memory_mb,
            storage_mb: sandbox.storage_mb,
            working_dir: Some(WORKSPACE_DIR.to_string()),
            labels,
            ..Default::default()
        })
    }

    /// Route a failed transition to `error`, keeping the original failure
    async fn fail(&self, sandbox_id: &str, err: SandboxError) -> SandboxError {
        let message = match &err {
            SandboxError::PolicyViolation(v) => v.violations.join("; "),
            other => other.to_string(),
        };
        error!("Sandbox {} failed: {}", sandbox_id, message);

        if let Err(e) = self
            .set_status(sandbox_id, SandboxStatus::Error, Some(message))
            .await
        {
            error!(
                "Failed to record error state for sandbox {}: {}",
                sandbox_id, e
            );
        }
        err
    }

    async fn set_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        self.storage
            .update_sandbox_status(sandbox_id, status, error_message.clone())
            .await?;

        // Nobody listening is the normal case
        let _ = self.event_tx.send(SandboxEvent {
            sandbox_id: sandbox_id.to_string(),
            status,
            error_message,
        });
        Ok(())
    }

    async fn container_id(&self, sandbox_id: &str) -> Result<String> {
        self.storage
            .get_sandbox(sandbox_id)
            .await?
            .container_id
            .ok_or_else(|| {
                SandboxError::InvalidState(format!(
                    "Sandbox {} has no container yet",
                    sandbox_id
                ))
            })
    }

    async fn cleanup_container(&self, container_id: &str) -> CleanupOutcome {
        if let Err(e) = self
            .provider
            .stop_container(container_id, self.stop_timeout_secs)
            .await
        {
            warn!("Failed to stop container {} before removal: {}", container_id, e);
        }

        match self.provider.remove_container(container_id, true).await {
            Ok(()) => CleanupOutcome::Done,
            Err(e) => {
                warn!("Failed to remove container {}: {}", container_id, e);
                CleanupOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Engine-side name of a sandbox's container
pub fn container_name(sandbox_id: &str) -> String {
    format!("devbox-{}", sandbox_id)
}

fn config_change(sandbox: &Sandbox) -> ConfigChange {
    ConfigChange {
        restart_required: sandbox.status == SandboxStatus::Running,
    }
}

fn validate_port(port: &PortBinding) -> Result<()> {
    if port.container_port == 0 || port.host_port == 0 {
        return Err(SandboxError::InvalidRequest(
            "Ports must be between 1 and 65535".to_string(),
        ));
    }
    if port.protocol != "tcp" && port.protocol != "udp" {
        return Err(SandboxError::InvalidRequest(format!(
            "Unsupported protocol '{}', expected tcp or udp",
            port.protocol
        )));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> Result<()> {
    let valid = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "Invalid environment variable name '{}'",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("sbx_abc"), "devbox-sbx_abc");
    }

    #[test]
    fn test_validate_env_key() {
        assert!(validate_env_key("PATH").is_ok());
        assert!(validate_env_key("_private_1").is_ok());
        assert!(validate_env_key("1BAD").is_err());
        assert!(validate_env_key("BAD-KEY").is_err());
        assert!(validate_env_key("").is_err());
    }

    #[test]
    fn test_validate_port() {
        let port = |host, container, protocol: &str| PortBinding {
            host_port: host,
            container_port: container,
            protocol: protocol.to_string(),
        };
        assert!(validate_port(&port(8080, 80, "tcp")).is_ok());
        assert!(validate_port(&port(53, 53, "udp")).is_ok());
        assert!(validate_port(&port(0, 80, "tcp")).is_err());
        assert!(validate_port(&port(8080, 80, "sctp")).is_err());
    }
}
