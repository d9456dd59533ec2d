// ABOUTME: Session lifecycle manager for shells, terminal multiplexers and IDE servers in sandboxes
// ABOUTME: Launches and kills in-sandbox processes via exec and reaps idle sessions in two phases

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::manager::WORKSPACE_DIR;
use crate::network::CleanupOutcome;
use crate::providers::{ExecRequest, ExecResult, Provider, ProviderError};
use crate::storage::{
    Sandbox, SandboxStatus, SandboxStorage, Session, SessionStatus, SessionType,
};

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u32 = 60;

/// Inactivity after which an active session is marked idle
pub const DEFAULT_INACTIVITY_WINDOW_MINUTES: u64 = 30;

/// Port the IDE server listens on inside the container
pub const IDE_SERVER_PORT: u16 = 8080;

/// Environment variable tagging processes that belong to a shell session
pub const SESSION_TAG_ENV: &str = "DEVBOX_SESSION";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_type: SessionType,
    pub name: String,
    pub idle_timeout_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdleSweepReport {
    pub marked_idle: u64,
    pub expired: Vec<String>,
}

/// Name of the tmux session backing a terminal session, if it has one
pub fn tmux_target(session: &Session) -> Option<String> {
    match session.session_type {
        SessionType::Multiplexer => Some(session.name.clone()),
        // Keyed by id so a shell never shares a name with a user's multiplexer
        SessionType::Shell => Some(format!("devbox-shell-{}", session.id)),
        SessionType::IdeServer => None,
    }
}

/// Exec request that launches a session's process
pub fn launch_command(session: &Session) -> ExecRequest {
    match session.session_type {
        SessionType::Multiplexer => {
            ExecRequest::new(["tmux", "new-session", "-d", "-s", session.name.as_str()])
        }
        SessionType::Shell => ExecRequest::new([
            "tmux".to_string(),
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            format!("devbox-shell-{}", session.id),
            "-e".to_string(),
            format!("{}={}", SESSION_TAG_ENV, session.id),
            "/bin/sh".to_string(),
            "-l".to_string(),
        ])
        .with_env(SESSION_TAG_ENV, session.id.as_str()),
        SessionType::IdeServer => ExecRequest::new([
            "code-server".to_string(),
            "--bind-addr".to_string(),
            format!("0.0.0.0:{}", IDE_SERVER_PORT),
            "--auth".to_string(),
            "none".to_string(),
            WORKSPACE_DIR.to_string(),
        ])
        .detached(),
    }
}

/// Exec request that stops a session's process
pub fn kill_command(session: &Session) -> ExecRequest {
    match tmux_target(session) {
        Some(target) => ExecRequest::new([
            "tmux".to_string(),
            "kill-session".to_string(),
            "-t".to_string(),
            target,
        ]),
        None => ExecRequest::new(["pkill", "-f", "code-server"]),
    }
}

/// Run a session's kill command. Never fails; the outcome is reported.
pub(crate) async fn kill_session_process(
    provider: &dyn Provider,
    sandbox: &Sandbox,
    session: &Session,
) -> CleanupOutcome {
    let container_id = match (&sandbox.container_id, sandbox.status) {
        (Some(container_id), SandboxStatus::Running) => container_id,
        _ => return CleanupOutcome::Skipped,
    };

    match provider
        .exec_command(container_id, kill_command(session))
        .await
    {
        Ok(_) => CleanupOutcome::Done,
        Err(e) => {
            warn!(
                "Failed to kill {} session {} in sandbox {}: {}",
                session.session_type, session.id, sandbox.id, e
            );
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

fn validate_session_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "Invalid session name '{}': use 1-64 letters, digits, '-' or '_'",
            name
        )))
    }
}

/// Fail with the process's stderr if an attached exec exited non-zero
fn check_exit(result: ExecResult, what: &str) -> std::result::Result<ExecResult, ProviderError> {
    match result.exit_code {
        Some(code) if code != 0 => Err(ProviderError::ExecError(format!(
            "{} exited with status {}: {}",
            what,
            code,
            String::from_utf8_lossy(&result.stderr).trim()
        ))),
        _ => Ok(result),
    }
}

pub struct SessionManager {
    storage: Arc<SandboxStorage>,
    provider: Arc<dyn Provider>,
    inactivity_window: Duration,
}

impl SessionManager {
    pub fn new(storage: Arc<SandboxStorage>, provider: Arc<dyn Provider>) -> Self {
        Self {
            storage,
            provider,
            inactivity_window: Duration::minutes(DEFAULT_INACTIVITY_WINDOW_MINUTES as i64),
        }
    }

    pub fn with_inactivity_window(mut self, window: std::time::Duration) -> Self {
        self.inactivity_window =
            Duration::from_std(window).unwrap_or(Duration::minutes(DEFAULT_INACTIVITY_WINDOW_MINUTES as i64));
        self
    }

    /// Start a session in a running sandbox
    pub async fn create(&self, sandbox_id: &str, request: CreateSessionRequest) -> Result<Session> {
        validate_session_name(&request.name)?;
        let idle_timeout_minutes = request
            .idle_timeout_minutes
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_MINUTES);
        if idle_timeout_minutes == 0 {
            return Err(SandboxError::InvalidRequest(
                "idle_timeout_minutes must be greater than zero".to_string(),
            ));
        }

        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        let container_id = running_container(&sandbox)?.to_string();

        let now = Utc::now();
        let session = self
            .storage
            .create_session(Session {
                id: uuid::Uuid::new_v4().to_string(),
                sandbox_id: sandbox_id.to_string(),
                session_type: request.session_type,
                name: request.name,
                status: SessionStatus::Starting,
                connection_url: None,
                idle_timeout_minutes,
                last_activity_at: now,
                created_at: now,
                terminated_at: None,
            })
            .await?;

        info!(
            "Launching {} session {} ({}) in sandbox {}",
            session.session_type, session.id, session.name, sandbox_id
        );

        let launched = self
            .provider
            .exec_command(&container_id, launch_command(&session))
            .await
            .and_then(|result| check_exit(result, "Session launch"));

        if let Err(e) = launched {
            warn!("Failed to launch session {}: {}", session.id, e);
            self.storage.terminate_session(&session.id).await?;
            return Err(SandboxError::EngineFailure(e));
        }

        if let Err(e) = self.activate(&session, &container_id).await {
            warn!("Failed to activate session {}, rolling back: {}", session.id, e);
            kill_session_process(self.provider.as_ref(), &sandbox, &session).await;
            if let Err(cleanup) = self.storage.terminate_session(&session.id).await {
                warn!("Failed to terminate session {}: {}", session.id, cleanup);
            }
            return Err(e);
        }

        Ok(self.storage.get_session(&session.id).await?)
    }

    async fn activate(&self, session: &Session, container_id: &str) -> Result<()> {
        let connection_url = match session.session_type {
            SessionType::IdeServer => Some(self.ide_url(container_id).await?),
            _ => None,
        };

        self.storage
            .activate_session(&session.id, connection_url.as_deref())
            .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        Ok(self.storage.get_session(session_id).await?)
    }

    pub async fn list(&self, sandbox_id: &str, include_terminated: bool) -> Result<Vec<Session>> {
        Ok(self
            .storage
            .list_sessions(sandbox_id, include_terminated)
            .await?)
    }

    /// Terminate a session. Terminating a terminated session returns it unchanged.
    pub async fn terminate(&self, session_id: &str) -> Result<Session> {
        let session = self.storage.get_session(session_id).await?;

        if self.storage.terminate_session(session_id).await? {
            let sandbox = self.storage.get_sandbox(&session.sandbox_id).await?;
            kill_session_process(self.provider.as_ref(), &sandbox, &session).await;
            info!("Terminated session {}", session_id);
        }

        Ok(self.storage.get_session(session_id).await?)
    }

    /// Stamp activity on a session, waking it if idle. Returns false if it is terminated.
    pub async fn record_activity(&self, session_id: &str) -> Result<bool> {
        Ok(self.storage.record_session_activity(session_id).await?)
    }

    /// Type literal input into a terminal session
    pub async fn send_input(&self, session_id: &str, data: &str) -> Result<()> {
        let (target, container_id) = self.live_terminal(session_id).await?;

        let result = self
            .provider
            .exec_command(
                &container_id,
                ExecRequest::new(["tmux", "send-keys", "-t", target.as_str(), "-l", data]),
            )
            .await?;
        check_exit(result, "tmux send-keys")?;

        self.record_activity(session_id).await?;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(SandboxError::InvalidRequest(
                "Terminal size must be non-zero".to_string(),
            ));
        }
        let (target, container_id) = self.live_terminal(session_id).await?;

        let result = self
            .provider
            .exec_command(
                &container_id,
                ExecRequest::new([
                    "tmux".to_string(),
                    "resize-window".to_string(),
                    "-t".to_string(),
                    target,
                    "-x".to_string(),
                    cols.to_string(),
                    "-y".to_string(),
                    rows.to_string(),
                ]),
            )
            .await?;
        check_exit(result, "tmux resize-window")?;

        self.record_activity(session_id).await?;
        Ok(())
    }

    /// Current screen contents of a terminal session
    pub async fn capture_output(&self, session_id: &str) -> Result<String> {
        let (target, container_id) = self.live_terminal(session_id).await?;

        let result = self
            .provider
            .exec_command(
                &container_id,
                ExecRequest::new(["tmux", "capture-pane", "-p", "-t", target.as_str()]),
            )
            .await?;
        let result = check_exit(result, "tmux capture-pane")?;

        Ok(String::from_utf8_lossy(&result.stdout).into_owned())
    }

    // ========================================================================
    // IDLE SWEEPS
    // ========================================================================

    /// Mark active sessions with no activity inside the inactivity window as idle
    pub async fn mark_idle_sessions(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.inactivity_window;
        let marked = self.storage.mark_idle_sessions(cutoff).await?;
        if marked > 0 {
            debug!("Marked {} sessions idle", marked);
        }
        Ok(marked)
    }

    /// Terminate idle sessions that exceeded their own idle timeout
    pub async fn expire_idle_sessions(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut expired = Vec::new();

        for session in self
            .storage
            .list_sessions_by_status(SessionStatus::Idle)
            .await?
        {
            let cutoff = now - Duration::minutes(session.idle_timeout_minutes as i64);
            if session.last_activity_at > cutoff {
                continue;
            }

            // Re-checked inside the update; activity since the listing wins
            if !self.storage.expire_idle_session(&session.id, cutoff).await? {
                continue;
            }

            info!(
                "Session {} expired after {} idle minutes",
                session.id, session.idle_timeout_minutes
            );
            match self.storage.get_sandbox(&session.sandbox_id).await {
                Ok(sandbox) => {
                    kill_session_process(self.provider.as_ref(), &sandbox, &session).await;
                }
                Err(e) => warn!("Sandbox of expired session {} unavailable: {}", session.id, e),
            }
            expired.push(session.id);
        }

        Ok(expired)
    }

    /// Both idle phases, in order
    pub async fn run_idle_sweep(&self) -> Result<IdleSweepReport> {
        Ok(IdleSweepReport {
            marked_idle: self.mark_idle_sessions().await?,
            expired: self.expire_idle_sessions().await?,
        })
    }

    /// The tmux target and container of a live terminal session
    async fn live_terminal(&self, session_id: &str) -> Result<(String, String)> {
        let session = self.storage.get_session(session_id).await?;

        let Some(target) = tmux_target(&session) else {
            return Err(SandboxError::InvalidState(format!(
                "Session {} is an {} session and has no terminal",
                session_id, session.session_type
            )));
        };
        if session.status == SessionStatus::Terminated {
            return Err(SandboxError::InvalidState(format!(
                "Session {} is terminated",
                session_id
            )));
        }

        let sandbox = self.storage.get_sandbox(&session.sandbox_id).await?;
        let container_id = running_container(&sandbox)?.to_string();
        Ok((target, container_id))
    }

    /// URL of the IDE server, through the host port the engine actually bound
    async fn ide_url(&self, container_id: &str) -> Result<String> {
        let info = self.provider.get_container_info(container_id).await?;
        let host_port = info
            .ports
            .get(&IDE_SERVER_PORT)
            .copied()
            .unwrap_or(IDE_SERVER_PORT);
        Ok(format!("http://localhost:{}", host_port))
    }
}

fn running_container(sandbox: &Sandbox) -> Result<&str> {
    match (&sandbox.container_id, sandbox.status) {
        (Some(container_id), SandboxStatus::Running) => Ok(container_id),
        _ => Err(SandboxError::InvalidState(format!(
            "Sandbox {} is {}, sessions need a running sandbox",
            sandbox.id, sandbox.status
        ))),
    }
}
