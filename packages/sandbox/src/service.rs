// ABOUTME: Wires storage, engine provider, hub, sessions and streams into one running service
// ABOUTME: Owns the periodic idle, retention and health tasks and the ordered shutdown sequence

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::gateway::Gateway;
use crate::hub::Hub;
use crate::log_store::LogStore;
use crate::manager::SandboxManager;
use crate::protocol::Envelope;
use crate::providers::{DockerProvider, Provider, ProviderError};
use crate::retention::RetentionEngine;
use crate::sessions::SessionManager;
use crate::storage::{SandboxStatus, SandboxStorage};
use crate::streaming::LogStreamer;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Container engine error: {0}")]
    Engine(#[from] ProviderError),
}

/// Open the SQLite database and bring its schema up to date
pub async fn open_database(database_url: &str) -> Result<SqlitePool, ServiceError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    debug!("Connecting to database: {}", database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready");

    Ok(pool)
}

pub struct SandboxService {
    config: ServiceConfig,
    storage: Arc<SandboxStorage>,
    logs: Arc<LogStore>,
    hub: Arc<Hub>,
    manager: Arc<SandboxManager>,
    sessions: Arc<SessionManager>,
    streamer: Arc<LogStreamer>,
    gateway: Arc<Gateway>,
    retention: Arc<RetentionEngine>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxService {
    /// Connect to the database and the local container engine
    pub async fn connect(config: ServiceConfig) -> Result<Self, ServiceError> {
        let pool = open_database(&config.database_url).await?;

        let provider = match &config.engine_socket {
            Some(socket) => DockerProvider::with_socket(socket, config.image_pull_timeout)?,
            None => DockerProvider::with_pull_timeout(config.image_pull_timeout)?,
        };
        if !provider.is_available().await.unwrap_or(false) {
            warn!("Container engine is not reachable; lifecycle operations will fail until it is");
        }

        Ok(Self::from_parts(config, pool, Arc::new(provider)))
    }

    /// Assemble the service from an open pool and any engine provider
    pub fn from_parts(config: ServiceConfig, pool: SqlitePool, provider: Arc<dyn Provider>) -> Self {
        let storage = Arc::new(SandboxStorage::new(pool.clone()));
        let logs = Arc::new(LogStore::new(pool));
        let hub = Arc::new(Hub::new(config.hub_client_capacity));

        let streamer = Arc::new(LogStreamer::new(
            hub.clone(),
            logs.clone(),
            storage.clone(),
            provider.clone(),
        ));
        let manager = Arc::new(
            SandboxManager::new(
                storage.clone(),
                logs.clone(),
                provider.clone(),
                config.policy.clone(),
            )
            .with_stop_timeout(config.stop_timeout_secs)
            .with_log_streamer(streamer.clone()),
        );
        let sessions = Arc::new(
            SessionManager::new(storage.clone(), provider)
                .with_inactivity_window(config.inactivity_window),
        );
        let gateway = Arc::new(Gateway::new(
            hub.clone(),
            storage.clone(),
            sessions.clone(),
            streamer.clone(),
        ));
        let retention = Arc::new(RetentionEngine::new(logs.clone(), config.retention.clone()));

        Self {
            config,
            storage,
            logs,
            hub,
            manager,
            sessions,
            streamer,
            gateway,
            retention,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<SandboxStorage> {
        self.storage.clone()
    }

    pub fn logs(&self) -> Arc<LogStore> {
        self.logs.clone()
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn manager(&self) -> Arc<SandboxManager> {
        self.manager.clone()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn streamer(&self) -> Arc<LogStreamer> {
        self.streamer.clone()
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub fn retention(&self) -> Arc<RetentionEngine> {
        self.retention.clone()
    }

    /// Spawn the idle sweep, log retention, hub health check and status relay tasks
    pub async fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().await;

        let sessions = self.sessions.clone();
        tasks.push(self.spawn_periodic(
            "session idle sweep",
            self.config.idle_sweep_interval,
            move || {
                let sessions = sessions.clone();
                async move {
                    match sessions.run_idle_sweep().await {
                        Ok(report) if !report.expired.is_empty() => {
                            info!(
                                "Idle sweep marked {} sessions idle and expired {}",
                                report.marked_idle,
                                report.expired.len()
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Session idle sweep failed: {}", e),
                    }
                }
            },
        ));

        let retention = self.retention.clone();
        tasks.push(self.spawn_periodic(
            "log retention",
            self.config.retention_interval,
            move || {
                let retention = retention.clone();
                async move {
                    if let Err(e) = retention.run_cleanup().await {
                        error!("Log retention failed: {}", e);
                    }
                }
            },
        ));

        let hub = self.hub.clone();
        let streamer = self.streamer.clone();
        tasks.push(self.spawn_periodic(
            "hub health check",
            self.config.health_check_interval,
            move || {
                let hub = hub.clone();
                let streamer = streamer.clone();
                async move {
                    let report = hub.health_check().await;
                    for sandbox_id in report.orphaned_sandboxes {
                        streamer.stop_stream(&sandbox_id).await;
                    }
                }
            },
        ));

        tasks.push(self.spawn_status_relay());
    }

    /// Stop background work, close streams, settle lifecycle operations, then drop clients
    pub async fn shutdown(&self) {
        info!("Shutting down sandbox service");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task panicked: {}", e);
            }
        }

        self.streamer.stop_all().await;
        self.manager.drain().await;
        self.hub.close_all().await;
        info!("Sandbox service stopped");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            info!("Started {} task (interval: {:?})", name, period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            debug!("Stopped {} task", name);
        })
    }

    /// Forward lifecycle status changes to sandbox subscribers
    fn spawn_status_relay(&self) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let hub = self.hub.clone();
        let streamer = self.streamer.clone();
        let mut events = self.manager.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if event.status != SandboxStatus::Running {
                            streamer.stop_stream(&event.sandbox_id).await;
                        } else if hub.sandbox_subscriber_count(&event.sandbox_id).await > 0 {
                            // Watchers of a restarted sandbox keep receiving logs
                            if let Err(e) = streamer.ensure_stream(&event.sandbox_id).await {
                                warn!("Failed to reopen logs for sandbox {}: {}", event.sandbox_id, e);
                            }
                        }
                        hub.broadcast_to_sandbox(
                            &event.sandbox_id,
                            Envelope::sandbox_status(
                                &event.sandbox_id,
                                event.status,
                                event.error_message.as_deref(),
                            ),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Status relay lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_database_creates_file_and_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devbox.db");
        let url = format!("sqlite://{}", path.display());

        let pool = open_database(&url).await.unwrap();
        assert!(path.exists());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'sandbox%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "sandbox_env_vars",
                "sandbox_logs",
                "sandbox_ports",
                "sandbox_sessions",
                "sandboxes",
            ]
        );

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(journal_mode, "wal");
        pool.close().await;

        // Reopening an up-to-date database applies nothing new
        let pool = open_database(&url).await.unwrap();
        pool.close().await;
    }
}
