// ABOUTME: Storage layer for sandboxes, port mappings, environment variables and sessions
// ABOUTME: Provides CRUD and conditional state updates for sandbox data in SQLite

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(db.message().to_string())
            }
            _ => Self::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Format a timestamp for storage. Fixed-width nanosecond UTC so text order is time order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(s.to_string()))
}

fn parse_optional_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub image: String,

    // Resource limits
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub storage_mb: u64,

    /// Set on first start and kept across restarts
    pub container_id: Option<String>,
    pub status: SandboxStatus,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub id: Option<i64>,
    pub sandbox_id: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub id: Option<i64>,
    pub sandbox_id: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Shell,
    Multiplexer,
    IdeServer,
}

impl SessionType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Shell => "shell",
            Self::Multiplexer => "multiplexer",
            Self::IdeServer => "ide-server",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(Self::Shell),
            "multiplexer" => Ok(Self::Multiplexer),
            "ide-server" => Ok(Self::IdeServer),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    Idle,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(Self::Starting),
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "terminated" => Ok(Self::Terminated),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub sandbox_id: String,
    pub session_type: SessionType,
    pub name: String,
    pub status: SessionStatus,
    /// Only set for ide-server sessions
    pub connection_url: Option<String>,
    pub idle_timeout_minutes: u32,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

pub struct SandboxStorage {
    pool: SqlitePool,
}

const SANDBOX_COLUMNS: &str = r#"
    id, project_id, name, image, cpu_cores, memory_mb, storage_mb,
    container_id, status, error_message, created_at, started_at, stopped_at
"#;

const SESSION_COLUMNS: &str = r#"
    id, sandbox_id, session_type, name, status, connection_url,
    idle_timeout_minutes, last_activity_at, created_at, terminated_at
"#;

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    /// Create a sandbox with its port mappings and environment variables in a single transaction
    pub async fn create_sandbox(
        &self,
        mut sandbox: Sandbox,
        ports: Vec<PortMapping>,
        env_vars: Vec<EnvVar>,
    ) -> Result<Sandbox> {
        // Generate ID if not provided
        if sandbox.id.is_empty() {
            sandbox.id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, project_id, name, image, cpu_cores, memory_mb, storage_mb,
                container_id, status, error_message, created_at, started_at, stopped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.project_id)
        .bind(&sandbox.name)
        .bind(&sandbox.image)
        .bind(sandbox.cpu_cores)
        .bind(sandbox.memory_mb as i64)
        .bind(sandbox.storage_mb as i64)
        .bind(&sandbox.container_id)
        .bind(sandbox.status.as_str())
        .bind(&sandbox.error_message)
        .bind(format_timestamp(&sandbox.created_at))
        .bind(sandbox.started_at.as_ref().map(format_timestamp))
        .bind(sandbox.stopped_at.as_ref().map(format_timestamp))
        .execute(&mut *tx)
        .await?;

        for port in ports {
            sqlx::query(
                r#"
                INSERT INTO sandbox_ports (sandbox_id, container_port, host_port, protocol, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&sandbox.id)
            .bind(port.container_port as i64)
            .bind(port.host_port as i64)
            .bind(&port.protocol)
            .bind(format_timestamp(&port.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for env_var in env_vars {
            sqlx::query(
                r#"
                INSERT INTO sandbox_env_vars (sandbox_id, key, value, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&sandbox.id)
            .bind(&env_var.key)
            .bind(&env_var.value)
            .bind(format_timestamp(&env_var.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(sandbox)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandboxes WHERE id = ?1",
            SANDBOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_sandbox(row),
            None => Err(StorageError::NotFound {
                kind: "Sandbox",
                id: id.to_string(),
            }),
        }
    }

    pub async fn list_sandboxes(
        &self,
        project_id: Option<&str>,
        status: Option<SandboxStatus>,
    ) -> Result<Vec<Sandbox>> {
        let mut query = format!("SELECT {} FROM sandboxes WHERE 1=1", SANDBOX_COLUMNS);

        let mut param_count = 0;
        if project_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND project_id = ?{}", param_count));
        }
        if status.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND status = ?{}", param_count));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);

        if let Some(pid) = project_id {
            q = q.bind(pid);
        }
        if let Some(s) = &status {
            q = q.bind(s.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| self.row_to_sandbox(row))
            .collect()
    }

    /// Persist a lifecycle transition.
    ///
    /// `running` stamps `started_at`, `stopped` stamps `stopped_at`; both clear the error message.
    /// `error` records the given message.
    pub async fn update_sandbox_status(
        &self,
        id: &str,
        status: SandboxStatus,
        error: Option<String>,
    ) -> Result<()> {
        let now = format_timestamp(&Utc::now());

        let query = match status {
            SandboxStatus::Running => {
                "UPDATE sandboxes SET status = ?1, error_message = NULL, started_at = ?2 WHERE id = ?3"
            }
            SandboxStatus::Stopped => {
                "UPDATE sandboxes SET status = ?1, error_message = NULL, stopped_at = ?2 WHERE id = ?3"
            }
            SandboxStatus::Error => {
                "UPDATE sandboxes SET status = ?1, error_message = ?2 WHERE id = ?3"
            }
            SandboxStatus::Starting | SandboxStatus::Stopping => {
                "UPDATE sandboxes SET status = ?1 WHERE id = ?3"
            }
        };

        let second = match status {
            SandboxStatus::Error => error,
            SandboxStatus::Running | SandboxStatus::Stopped => Some(now),
            SandboxStatus::Starting | SandboxStatus::Stopping => None,
        };

        let result = sqlx::query(query)
            .bind(status.as_str())
            .bind(second)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "Sandbox",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    /// Record the container id of a sandbox. A sandbox's container id is written only once.
    pub async fn set_container_id(&self, id: &str, container_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET container_id = ?1 WHERE id = ?2 AND container_id IS NULL",
        )
        .bind(container_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing sandbox from one that already has a container
            let existing = self.get_sandbox(id).await?;
            return Err(StorageError::Duplicate(format!(
                "Sandbox {} already has container {}",
                id,
                existing.container_id.unwrap_or_default()
            )));
        }

        Ok(())
    }

    /// Delete a sandbox; child rows cascade
    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "Sandbox",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    // ========================================================================
    // PORT MAPPING OPERATIONS
    // ========================================================================

    pub async fn add_port_mapping(&self, port: PortMapping) -> Result<PortMapping> {
        let result = sqlx::query(
            r#"
            INSERT INTO sandbox_ports (sandbox_id, container_port, host_port, protocol, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&port.sandbox_id)
        .bind(port.container_port as i64)
        .bind(port.host_port as i64)
        .bind(&port.protocol)
        .bind(format_timestamp(&port.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match StorageError::from(e) {
            StorageError::Duplicate(_) => StorageError::Duplicate(format!(
                "Container port {} is already mapped for sandbox {}",
                port.container_port, port.sandbox_id
            )),
            other => other,
        })?;

        Ok(PortMapping {
            id: Some(result.last_insert_rowid()),
            ..port
        })
    }

    pub async fn list_port_mappings(&self, sandbox_id: &str) -> Result<Vec<PortMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, container_port, host_port, protocol, created_at
            FROM sandbox_ports
            WHERE sandbox_id = ?1
            ORDER BY container_port
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| self.row_to_port_mapping(row))
            .collect()
    }

    pub async fn remove_port_mapping(&self, sandbox_id: &str, container_port: u16) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM sandbox_ports WHERE sandbox_id = ?1 AND container_port = ?2")
                .bind(sandbox_id)
                .bind(container_port as i64)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "Port mapping",
                id: format!("{}:{}", sandbox_id, container_port),
            });
        }

        Ok(())
    }

    // ========================================================================
    // ENVIRONMENT VARIABLE OPERATIONS
    // ========================================================================

    /// Insert or replace the value of an environment variable
    pub async fn set_env_var(&self, sandbox_id: &str, key: &str, value: &str) -> Result<EnvVar> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO sandbox_env_vars (sandbox_id, key, value, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (sandbox_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(sandbox_id)
        .bind(key)
        .bind(value)
        .bind(format_timestamp(&now))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, sandbox_id, key, value, created_at
            FROM sandbox_env_vars
            WHERE sandbox_id = ?1 AND key = ?2
            "#,
        )
        .bind(sandbox_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        self.row_to_env_var(row)
    }

    pub async fn list_env_vars(&self, sandbox_id: &str) -> Result<Vec<EnvVar>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, key, value, created_at
            FROM sandbox_env_vars
            WHERE sandbox_id = ?1
            ORDER BY key
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| self.row_to_env_var(row))
            .collect()
    }

    pub async fn remove_env_var(&self, sandbox_id: &str, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sandbox_env_vars WHERE sandbox_id = ?1 AND key = ?2")
            .bind(sandbox_id)
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "Environment variable",
                id: format!("{}:{}", sandbox_id, key),
            });
        }

        Ok(())
    }

    // ========================================================================
    // SESSION OPERATIONS
    // ========================================================================

    /// Insert a session. A live session with the same (sandbox, type, name) is a Duplicate.
    pub async fn create_session(&self, session: Session) -> Result<Session> {
        sqlx::query(
            r#"
            INSERT INTO sandbox_sessions (
                id, sandbox_id, session_type, name, status, connection_url,
                idle_timeout_minutes, last_activity_at, created_at, terminated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&session.id)
        .bind(&session.sandbox_id)
        .bind(session.session_type.as_str())
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(&session.connection_url)
        .bind(session.idle_timeout_minutes as i64)
        .bind(format_timestamp(&session.last_activity_at))
        .bind(format_timestamp(&session.created_at))
        .bind(session.terminated_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| match StorageError::from(e) {
            StorageError::Duplicate(_) => StorageError::Duplicate(format!(
                "A live {} session named '{}' already exists in sandbox {}",
                session.session_type, session.name, session.sandbox_id
            )),
            other => other,
        })?;

        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandbox_sessions WHERE id = ?1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_session(row),
            None => Err(StorageError::NotFound {
                kind: "Session",
                id: id.to_string(),
            }),
        }
    }

    pub async fn list_sessions(
        &self,
        sandbox_id: &str,
        include_terminated: bool,
    ) -> Result<Vec<Session>> {
        let mut query = format!(
            "SELECT {} FROM sandbox_sessions WHERE sandbox_id = ?1",
            SESSION_COLUMNS
        );
        if !include_terminated {
            query.push_str(" AND status != 'terminated'");
        }
        query.push_str(" ORDER BY created_at");

        let rows = sqlx::query(&query)
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| self.row_to_session(row))
            .collect()
    }

    pub async fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sandbox_sessions WHERE status = ?1 ORDER BY last_activity_at",
            SESSION_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| self.row_to_session(row))
            .collect()
    }

    /// Move a launched session from `starting` to `active`
    pub async fn activate_session(&self, id: &str, connection_url: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = 'active', connection_url = ?1, last_activity_at = ?2
            WHERE id = ?3 AND status = 'starting'
            "#,
        )
        .bind(connection_url)
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "Starting session",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    /// Mark a session terminated. Returns false if it already was.
    pub async fn terminate_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = 'terminated', terminated_at = ?1
            WHERE id = ?2 AND status != 'terminated'
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stamp activity and wake an idle session. Terminated sessions are left alone.
    ///
    /// Returns false when the session is terminated.
    pub async fn record_session_activity(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = CASE WHEN status = 'idle' THEN 'active' ELSE status END,
                last_activity_at = ?1
            WHERE id = ?2 AND status != 'terminated'
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Fails with NotFound if the session does not exist at all
            self.get_session(id).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Mark every active session with no activity since `cutoff` as idle
    pub async fn mark_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = 'idle'
            WHERE status = 'active' AND last_activity_at < ?1
            "#,
        )
        .bind(format_timestamp(&cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Terminate an idle session if it has seen no activity since `cutoff`.
    ///
    /// The status and activity check happen in the same statement as the
    /// transition, so a concurrent activity update always wins.
    pub async fn expire_idle_session(&self, id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = 'terminated', terminated_at = ?1
            WHERE id = ?2 AND status = 'idle' AND last_activity_at <= ?3
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(id)
        .bind(format_timestamp(&cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn row_to_sandbox(&self, row: SqliteRow) -> Result<Sandbox> {
        Ok(Sandbox {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            image: row.try_get("image")?,
            cpu_cores: row.try_get("cpu_cores")?,
            memory_mb: row.try_get::<i64, _>("memory_mb")? as u64,
            storage_mb: row.try_get::<i64, _>("storage_mb")? as u64,
            container_id: row.try_get("container_id")?,
            status: SandboxStatus::from_str(&row.try_get::<String, _>("status")?)?,
            error_message: row.try_get("error_message")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
            stopped_at: parse_optional_timestamp(row.try_get("stopped_at")?)?,
        })
    }

    fn row_to_port_mapping(&self, row: SqliteRow) -> Result<PortMapping> {
        Ok(PortMapping {
            id: Some(row.try_get("id")?),
            sandbox_id: row.try_get("sandbox_id")?,
            container_port: row.try_get::<i64, _>("container_port")? as u16,
            host_port: row.try_get::<i64, _>("host_port")? as u16,
            protocol: row.try_get("protocol")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn row_to_env_var(&self, row: SqliteRow) -> Result<EnvVar> {
        Ok(EnvVar {
            id: Some(row.try_get("id")?),
            sandbox_id: row.try_get("sandbox_id")?,
            key: row.try_get("key")?,
            value: row.try_get("value")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn row_to_session(&self, row: SqliteRow) -> Result<Session> {
        Ok(Session {
            id: row.try_get("id")?,
            sandbox_id: row.try_get("sandbox_id")?,
            session_type: SessionType::from_str(&row.try_get::<String, _>("session_type")?)?,
            name: row.try_get("name")?,
            status: SessionStatus::from_str(&row.try_get::<String, _>("status")?)?,
            connection_url: row.try_get("connection_url")?,
            idle_timeout_minutes: row.try_get::<i64, _>("idle_timeout_minutes")? as u32,
            last_activity_at: parse_timestamp(&row.try_get::<String, _>("last_activity_at")?)?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            terminated_at: parse_optional_timestamp(row.try_get("terminated_at")?)?,
        })
    }
}
