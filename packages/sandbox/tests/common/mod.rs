// ABOUTME: Shared fixtures for integration tests: in-memory database and a scripted engine
// ABOUTME: FakeProvider records every engine call and can be told which calls fail

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use devbox_sandbox::providers::{
    ContainerConfig, ContainerInfo, ContainerMetrics, ContainerStatus, ExecRequest, ExecResult,
    LogStreamOptions, NetworkInfo, NetworkSpec, Provider, ProviderError, RawLogStream, Result,
};
use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    failing: HashSet<&'static str>,
    containers: HashMap<String, ContainerConfig>,
    networks: Vec<NetworkInfo>,
    execs: Vec<ExecRequest>,
    exec_exit_code: Option<i64>,
    exec_stdout: Vec<u8>,
    log_chunks: Vec<Bytes>,
    stream_options: Vec<LogStreamOptions>,
    next_id: usize,
}

/// Scripted in-memory container engine
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
    start_delay: Mutex<Option<Duration>>,
    stream_delays: Mutex<HashMap<String, Duration>>,
    starts_in_flight: AtomicUsize,
    max_concurrent_starts: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail with an engine error
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.remove(operation);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    /// Hold `stream_logs` for one container before it answers
    pub fn set_stream_delay(&self, container_id: &str, delay: Duration) {
        self.stream_delays
            .lock()
            .unwrap()
            .insert(container_id.to_string(), delay);
    }

    /// Raw multiplexed bytes served by the next log streams
    pub fn set_log_chunks(&self, chunks: Vec<Vec<u8>>) {
        self.state.lock().unwrap().log_chunks = chunks.into_iter().map(Bytes::from).collect();
    }

    pub fn set_exec_result(&self, exit_code: i64, stdout: &str) {
        let mut state = self.state.lock().unwrap();
        state.exec_exit_code = Some(exit_code);
        state.exec_stdout = stdout.as_bytes().to_vec();
    }

    pub fn add_network(&self, name: &str, subnet: &str) {
        self.state.lock().unwrap().networks.push(NetworkInfo {
            id: format!("net-{}", name),
            name: name.to_string(),
            subnets: vec![subnet.to_string()],
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn execs(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn created_configs(&self) -> Vec<ContainerConfig> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn networks(&self) -> Vec<NetworkInfo> {
        self.state.lock().unwrap().networks.clone()
    }

    pub fn stream_options(&self) -> Vec<LogStreamOptions> {
        self.state.lock().unwrap().stream_options.clone()
    }

    pub fn max_concurrent_starts(&self) -> usize {
        self.max_concurrent_starts.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.to_string());
        if state.failing.contains(operation) {
            Err(ProviderError::ContainerError(format!(
                "{} failed (scripted)",
                operation
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn is_available(&self) -> Result<bool> {
        self.record("is_available")?;
        Ok(true)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.record("create_container")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(id.clone(), config.clone());
        Ok(id)
    }

    async fn start_container(&self, _container_id: &str) -> Result<()> {
        let in_flight = self.starts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_starts
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.starts_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.record("start_container")
    }

    async fn stop_container(&self, _container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.record("stop_container")
    }

    async fn restart_container(&self, _container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.record("restart_container")
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.record("remove_container")?;
        self.state.lock().unwrap().containers.remove(container_id);
        Ok(())
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo> {
        self.record("get_container_info")?;
        let state = self.state.lock().unwrap();
        let config = state
            .containers
            .get(container_id)
            .ok_or_else(|| ProviderError::NotFound(container_id.to_string()))?;
        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: config.name.clone(),
            status: ContainerStatus::Running,
            ip_address: None,
            ports: config
                .ports
                .iter()
                .map(|p| (p.container_port, p.host_port))
                .collect(),
            created_at: chrono::Utc::now(),
            started_at: None,
        })
    }

    async fn get_metrics(&self, _container_id: &str) -> Result<ContainerMetrics> {
        self.record("get_metrics")?;
        Ok(ContainerMetrics {
            cpu_usage_percent: 12.5,
            memory_usage_mb: 128,
            memory_limit_mb: 2048,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        })
    }

    async fn exec_command(&self, _container_id: &str, request: ExecRequest) -> Result<ExecResult> {
        self.record("exec_command")?;
        let mut state = self.state.lock().unwrap();
        let detach = request.detach;
        state.execs.push(request);
        if detach {
            return Ok(ExecResult::default());
        }
        Ok(ExecResult {
            exit_code: Some(state.exec_exit_code.unwrap_or(0)),
            stdout: state.exec_stdout.clone(),
            stderr: Vec::new(),
        })
    }

    async fn stream_logs(
        &self,
        container_id: &str,
        options: LogStreamOptions,
    ) -> Result<RawLogStream> {
        let delay = self.stream_delays.lock().unwrap().get(container_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.record("stream_logs")?;
        let mut state = self.state.lock().unwrap();
        let follow = options.follow;
        state.stream_options.push(options);

        let chunks = futures::stream::iter(state.log_chunks.clone().into_iter().map(Ok));
        if follow {
            // A followed stream stays open until the consumer closes it
            Ok(chunks.chain(futures::stream::pending()).boxed())
        } else {
            Ok(chunks.boxed())
        }
    }

    async fn pull_image(&self, _image: &str, _force: bool) -> Result<()> {
        self.record("pull_image")
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        self.record("image_exists")?;
        Ok(true)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        self.record("create_network")?;
        let id = format!("net-{}", spec.name);
        self.state.lock().unwrap().networks.push(NetworkInfo {
            id: id.clone(),
            name: spec.name.clone(),
            subnets: vec![spec.subnet.clone()],
        });
        Ok(id)
    }

    async fn find_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        self.record("find_network")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        self.record("list_networks")?;
        Ok(self.state.lock().unwrap().networks.clone())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record("remove_network")?;
        self.state.lock().unwrap().networks.retain(|n| n.name != name);
        Ok(())
    }
}
