// ABOUTME: Service configuration read from DEVBOX_* environment variables
// ABOUTME: Covers database, engine socket, security policy, retention and sweep intervals

use std::env;
use std::num::{ParseFloatError, ParseIntError};
use std::time::Duration;
use thiserror::Error;

use crate::hub::DEFAULT_CLIENT_CAPACITY;
use crate::policy::{NetworkIsolation, SecurityPolicy};
use crate::retention::RetentionPolicy;
use crate::sessions::DEFAULT_INACTIVITY_WINDOW_MINUTES;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid integer for {0}: {1}")]
    InvalidInteger(String, ParseIntError),
    #[error("Invalid number for {0}: {1}")]
    InvalidNumber(String, ParseFloatError),
    #[error("Invalid boolean for {0}: {1}")]
    InvalidBool(String, String),
    #[error("Invalid network isolation mode: {0}")]
    InvalidNetworkIsolation(String),
    #[error("{0} must be greater than zero")]
    NotPositive(String),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub engine_socket: Option<String>,
    pub policy: SecurityPolicy,
    pub retention: RetentionPolicy,
    pub retention_interval: Duration,
    pub idle_sweep_interval: Duration,
    /// Inactivity after which an active session is marked idle
    pub inactivity_window: Duration,
    pub health_check_interval: Duration,
    pub hub_client_capacity: usize,
    pub stop_timeout_secs: u64,
    pub image_pull_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://devbox.db?mode=rwc".to_string(),
            engine_socket: None,
            policy: SecurityPolicy::default(),
            retention: RetentionPolicy::default(),
            retention_interval: Duration::from_secs(60 * 60),
            idle_sweep_interval: Duration::from_secs(60),
            inactivity_window: Duration::from_secs(DEFAULT_INACTIVITY_WINDOW_MINUTES * 60),
            health_check_interval: Duration::from_secs(30),
            hub_client_capacity: DEFAULT_CLIENT_CAPACITY,
            stop_timeout_secs: 10,
            image_pull_timeout: Duration::from_secs(600),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; missing keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DEVBOX_DATABASE_URL") {
            config.database_url = url;
        }
        config.engine_socket = lookup("DEVBOX_ENGINE_SOCKET").filter(|s| !s.trim().is_empty());

        // Security policy
        let policy = &mut config.policy;
        if let Some(socket) = &config.engine_socket {
            policy.engine_socket_path = socket.trim_start_matches("unix://").to_string();
        }
        if let Some(list) = lookup("DEVBOX_ALLOWED_IMAGES") {
            policy.allowed_images = split_list(&list);
        }
        if let Some(list) = lookup("DEVBOX_BLOCKED_IMAGES") {
            policy.blocked_images = split_list(&list);
        }
        if let Some(list) = lookup("DEVBOX_DROP_CAPABILITIES") {
            policy.drop_capabilities = split_list(&list);
        }
        if let Some(v) = parse_bool(&lookup, "DEVBOX_PREVENT_SOCKET_MOUNT")? {
            policy.prevent_socket_mount = v;
        }
        if let Some(v) = parse_bool(&lookup, "DEVBOX_ENFORCE_NON_ROOT")? {
            policy.enforce_non_root = v;
        }
        if let Some(v) = parse_bool(&lookup, "DEVBOX_READ_ONLY_ROOT")? {
            policy.read_only_root = v;
        }
        if let Some(v) = parse_bool(&lookup, "DEVBOX_NO_NEW_PRIVILEGES")? {
            policy.no_new_privileges = v;
        }
        if let Some(mode) = lookup("DEVBOX_NETWORK_ISOLATION") {
            policy.network_isolation = mode
                .parse::<NetworkIsolation>()
                .map_err(|_| ConfigError::InvalidNetworkIsolation(mode.clone()))?;
        }

        // Retention
        if let Some(days) = parse_positive(&lookup, "DEVBOX_LOG_RETENTION_DAYS")? {
            config.retention.max_age = chrono::Duration::days(days as i64);
        }
        if let Some(mb) = lookup("DEVBOX_LOG_BUDGET_MB") {
            let mb = mb
                .trim()
                .parse::<f64>()
                .map_err(|e| ConfigError::InvalidNumber("DEVBOX_LOG_BUDGET_MB".to_string(), e))?;
            if !(mb > 0.0) {
                return Err(ConfigError::NotPositive("DEVBOX_LOG_BUDGET_MB".to_string()));
            }
            config.retention.max_bytes_per_sandbox = (mb * 1024.0 * 1024.0) as u64;
        }

        // Background sweeps
        if let Some(secs) = parse_positive(&lookup, "DEVBOX_RETENTION_INTERVAL_SECS")? {
            config.retention_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, "DEVBOX_IDLE_SWEEP_INTERVAL_SECS")? {
            config.idle_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(minutes) = parse_positive(&lookup, "DEVBOX_SESSION_INACTIVITY_MINUTES")? {
            config.inactivity_window = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = parse_positive(&lookup, "DEVBOX_HEALTH_CHECK_INTERVAL_SECS")? {
            config.health_check_interval = Duration::from_secs(secs);
        }

        if let Some(capacity) = parse_positive(&lookup, "DEVBOX_CLIENT_CHANNEL_CAPACITY")? {
            config.hub_client_capacity = capacity as usize;
        }
        if let Some(secs) = parse_u64(&lookup, "DEVBOX_STOP_TIMEOUT_SECS")? {
            config.stop_timeout_secs = secs;
        }
        if let Some(secs) = parse_positive(&lookup, "DEVBOX_IMAGE_PULL_TIMEOUT_SECS")? {
            config.image_pull_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidBool(key.to_string(), value)),
        },
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidInteger(key.to_string(), e))
        })
        .transpose()
}

fn parse_positive<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_u64(lookup, key)? {
        Some(0) => Err(ConfigError::NotPositive(key.to_string())),
        other => Ok(other),
    }
}
