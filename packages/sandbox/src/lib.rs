// ABOUTME: Ephemeral container dev sandboxes with persisted lifecycle, sessions and live logs
// ABOUTME: Re-exports the orchestrator, session manager, hub, log pipeline and service wiring

pub mod config;
pub mod demux;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod log_store;
pub mod manager;
pub mod network;
pub mod policy;
pub mod protocol;
pub mod providers;
pub mod retention;
pub mod service;
pub mod sessions;
pub mod storage;
pub mod streaming;

pub use config::{ConfigError, ServiceConfig};
pub use demux::{LogDemuxer, LogEntry, LogStream};
pub use error::{Result, SandboxError};
pub use gateway::Gateway;
pub use hub::{HealthReport, Hub};
pub use log_store::{LogPage, LogQuery, LogStore, StoredLogEntry};
pub use manager::{
    ConfigChange, CreateSandboxRequest, DeleteReport, SandboxEvent, SandboxManager,
};
pub use network::{derive_subnet, CleanupOutcome, Subnet};
pub use policy::{NetworkIsolation, PolicyViolation, SecurityPolicy};
pub use protocol::{Envelope, MessageType};
pub use providers::{DockerProvider, Provider, ProviderError};
pub use retention::{RetentionEngine, RetentionPolicy, RetentionReport};
pub use service::{open_database, SandboxService, ServiceError};
pub use sessions::{CreateSessionRequest, IdleSweepReport, SessionManager};
pub use storage::{
    EnvVar, PortMapping, Sandbox, SandboxStatus, SandboxStorage, Session, SessionStatus,
    SessionType, StorageError,
};
pub use streaming::LogStreamer;
