// ABOUTME: Security policy engine for container creation requests
// ABOUTME: Hardens container configs and validates them against image and mount rules

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::providers::ContainerConfig;

/// Default path of the container engine's control socket
pub const DEFAULT_ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// User the container runs as when non-root enforcement supplies one
pub const DEFAULT_NON_ROOT_USER: &str = "1000:1000";

/// Security option appended by hardening
pub const NO_NEW_PRIVILEGES: &str = "no-new-privileges:true";

/// Image patterns longer than this are refused to keep regex compilation bounded
const MAX_PATTERN_LENGTH: usize = 256;

/// A creation request that broke one or more policy rules
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Security policy violation: {}", .violations.join("; "))]
pub struct PolicyViolation {
    pub violations: Vec<String>,
}

/// How a sandbox's container is attached to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkIsolation {
    /// Engine default bridge, shared with other containers
    Shared,
    /// Dedicated bridge network per sandbox
    Isolated,
    /// Dedicated bridge network with no route outside the host
    Internal,
}

impl NetworkIsolation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Shared => "shared",
            Self::Isolated => "isolated",
            Self::Internal => "internal",
        }
    }
}

impl FromStr for NetworkIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared" | "none" => Ok(Self::Shared),
            "isolated" => Ok(Self::Isolated),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown network isolation mode: {}", other)),
        }
    }
}

impl fmt::Display for NetworkIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security policy applied to every container the orchestrator creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// When non-empty, images must match at least one of these glob patterns
    pub allowed_images: Vec<String>,
    /// Images matching any of these glob patterns are refused
    pub blocked_images: Vec<String>,
    /// Refuse and strip mounts of the engine control socket
    pub prevent_socket_mount: bool,
    /// Require a non-root user
    pub enforce_non_root: bool,
    /// Capabilities removed from every container
    pub drop_capabilities: Vec<String>,
    /// Mount the container root filesystem read-only
    pub read_only_root: bool,
    /// Forbid privilege escalation through setuid binaries
    pub no_new_privileges: bool,
    pub network_isolation: NetworkIsolation,
    /// Path of the engine control socket to guard
    pub engine_socket_path: String,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_images: Vec::new(),
            blocked_images: vec!["docker:*".to_string(), "dind:*".to_string()],
            prevent_socket_mount: true,
            enforce_non_root: true,
            drop_capabilities: [
                "NET_RAW",
                "SYS_ADMIN",
                "SYS_MODULE",
                "SYS_PTRACE",
                "SYS_BOOT",
                "MAC_ADMIN",
                "NET_ADMIN",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            read_only_root: false,
            no_new_privileges: true,
            network_isolation: NetworkIsolation::Isolated,
            engine_socket_path: DEFAULT_ENGINE_SOCKET.to_string(),
        }
    }
}

/// Apply the policy's hardening to a container config.
///
/// Unconditional and idempotent: running it twice yields the same config.
pub fn harden(config: &mut ContainerConfig, policy: &SecurityPolicy) {
    config.cap_drop = policy.drop_capabilities.clone();

    if policy.read_only_root {
        config.readonly_rootfs = true;
    }

    if policy.no_new_privileges && !config.security_opt.iter().any(|o| o == NO_NEW_PRIVILEGES) {
        config.security_opt.push(NO_NEW_PRIVILEGES.to_string());
    }

    if policy.enforce_non_root && config.user.as_deref().map_or(true, |u| u.trim().is_empty()) {
        config.user = Some(DEFAULT_NON_ROOT_USER.to_string());
    }

    config.privileged = false;

    if policy.prevent_socket_mount {
        let socket = policy.engine_socket_path.as_str();
        config
            .binds
            .retain(|bind| !bind_source(bind).contains(socket));
        config.mounts.retain(|mount| !mount.host_path.contains(socket));
    }
}

/// Check a container config against the policy, collecting every violation.
pub fn validate(config: &ContainerConfig, policy: &SecurityPolicy) -> Result<(), PolicyViolation> {
    let mut violations = Vec::new();

    if let Some(pattern) = policy
        .blocked_images
        .iter()
        .find(|p| matches_pattern(&config.image, p))
    {
        violations.push(format!(
            "Image '{}' matches blocked pattern '{}'",
            config.image, pattern
        ));
    }

    if !policy.allowed_images.is_empty()
        && !policy
            .allowed_images
            .iter()
            .any(|p| matches_pattern(&config.image, p))
    {
        violations.push(format!(
            "Image '{}' is not in the allowed image list",
            config.image
        ));
    }

    let socket = policy.engine_socket_path.as_str();
    for bind in &config.binds {
        if bind_source(bind).contains(socket) {
            violations.push(format!(
                "Bind mount '{}' exposes the engine socket {}",
                bind, socket
            ));
        }
    }
    for mount in &config.mounts {
        if mount.host_path.contains(socket) {
            violations.push(format!(
                "Mount '{}' exposes the engine socket {}",
                mount.host_path, socket
            ));
        }
    }

    if config.privileged {
        violations.push("Privileged mode is not allowed".to_string());
    }

    if policy.enforce_non_root && !is_non_root_user(config.user.as_deref()) {
        violations.push(format!(
            "Container must run as a non-root user (got '{}')",
            config.user.as_deref().unwrap_or("")
        ));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(PolicyViolation { violations })
    }
}

/// Glob match where `*` and `?` are the only wildcards
pub fn matches_pattern(image: &str, pattern: &str) -> bool {
    if pattern.len() > MAX_PATTERN_LENGTH {
        warn!(
            "Ignoring image pattern longer than {} characters",
            MAX_PATTERN_LENGTH
        );
        return false;
    }

    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");

    match Regex::new(&format!("^{}$", escaped)) {
        Ok(re) => re.is_match(image),
        Err(e) => {
            warn!("Invalid image pattern '{}': {}", pattern, e);
            false
        }
    }
}

fn is_non_root_user(user: Option<&str>) -> bool {
    let Some(user) = user.map(str::trim).filter(|u| !u.is_empty()) else {
        return false;
    };
    let name = user.split(':').next().unwrap_or(user);
    name != "root" && name != "0"
}

/// Host side of a `source:target[:mode]` bind string
fn bind_source(bind: &str) -> &str {
    bind.split(':').next().unwrap_or(bind)
}
