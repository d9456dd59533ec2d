// ABOUTME: Integration tests for sandbox lifecycle transitions against a scripted engine
// ABOUTME: Covers create, start, stop, restart, delete, policy rejection and per-sandbox serialization

mod common;

use common::{setup_test_db, FakeProvider};
use devbox_sandbox::providers::{ExecRequest, PortBinding};
use devbox_sandbox::{
    CleanupOutcome, CreateSandboxRequest, LogEntry, LogStore, LogStream, NetworkIsolation,
    SandboxError, SandboxManager, SandboxStatus, SandboxStorage, SecurityPolicy,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: Arc<SandboxManager>,
    provider: Arc<FakeProvider>,
    storage: Arc<SandboxStorage>,
    logs: Arc<LogStore>,
}

async fn harness_with_policy(policy: SecurityPolicy) -> Harness {
    let pool = setup_test_db().await;
    let storage = Arc::new(SandboxStorage::new(pool.clone()));
    let logs = Arc::new(LogStore::new(pool));
    let provider = Arc::new(FakeProvider::new());
    let manager = Arc::new(SandboxManager::new(
        storage.clone(),
        logs.clone(),
        provider.clone(),
        policy,
    ));

    Harness {
        manager,
        provider,
        storage,
        logs,
    }
}

async fn harness() -> Harness {
    harness_with_policy(SecurityPolicy::default()).await
}

fn request(image: &str) -> CreateSandboxRequest {
    CreateSandboxRequest {
        project_id: "proj_1".to_string(),
        name: "dev".to_string(),
        image: image.to_string(),
        ports: vec![PortBinding {
            host_port: 18080,
            container_port: 8080,
            protocol: "tcp".to_string(),
        }],
        env_vars: BTreeMap::from([("RUST_LOG".to_string(), "debug".to_string())]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_applies_defaults_and_touches_no_engine() {
    let h = harness().await;

    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    assert_eq!(sandbox.status, SandboxStatus::Stopped);
    assert_eq!(sandbox.cpu_cores, 2.0);
    assert_eq!(sandbox.memory_mb, 2048);
    assert_eq!(sandbox.storage_mb, 10240);
    assert_eq!(sandbox.container_id, None);
    assert!(h.provider.calls().is_empty());

    let ports = h.manager.list_port_mappings(&sandbox.id).await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].host_port, 18080);
}

#[rstest]
#[case::zero_cpu(Some(0.0), None)]
#[case::negative_cpu(Some(-1.0), None)]
#[case::nan_cpu(Some(f64::NAN), None)]
#[case::zero_memory(None, Some(0))]
#[tokio::test]
async fn test_create_rejects_non_positive_resources(
    #[case] cpu_cores: Option<f64>,
    #[case] memory_mb: Option<u64>,
) {
    let h = harness().await;

    let result = h
        .manager
        .create_sandbox(CreateSandboxRequest {
            cpu_cores,
            memory_mb,
            ..request("ubuntu:22.04")
        })
        .await;

    assert!(matches!(result, Err(SandboxError::InvalidRequest(_))));
    assert!(h.manager.list_sandboxes(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_first_start_creates_hardened_container_and_network() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let started = h.manager.start_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(started.status, SandboxStatus::Running);
    assert_eq!(started.container_id.as_deref(), Some("ctr-1"));
    assert!(started.started_at.is_some());

    let configs = h.provider.created_configs();
    assert_eq!(configs.len(), 1);
    let config = &configs[0];
    assert_eq!(config.user.as_deref(), Some("1000:1000"));
    assert!(!config.privileged);
    assert!(config.cap_drop.contains(&"NET_RAW".to_string()));
    assert!(config
        .security_opt
        .contains(&"no-new-privileges:true".to_string()));
    assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
    assert_eq!(config.env_vars.get("RUST_LOG").map(String::as_str), Some("debug"));

    let network = format!("devbox-net-{}", sandbox.id);
    assert_eq!(config.network.as_deref(), Some(network.as_str()));
    assert_eq!(h.provider.networks().len(), 1);
}

#[tokio::test]
async fn test_shared_network_mode_creates_no_network() {
    let h = harness_with_policy(SecurityPolicy {
        network_isolation: NetworkIsolation::Shared,
        ..Default::default()
    })
    .await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(h.provider.call_count("create_network"), 0);
    assert_eq!(h.provider.created_configs()[0].network, None);
}

#[tokio::test]
async fn test_blocked_image_ends_in_error_without_container() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("docker:dind")).await.unwrap();

    let result = h.manager.start_sandbox(&sandbox.id).await;

    match result {
        Err(SandboxError::PolicyViolation(v)) => {
            assert!(v.violations[0].contains("docker:*"));
        }
        other => panic!("expected a policy violation, got {:?}", other),
    }

    let sandbox = h.manager.get_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Error);
    assert_eq!(sandbox.container_id, None);
    assert!(sandbox
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("blocked pattern")));
    assert_eq!(h.provider.call_count("create_container"), 0);
}

#[tokio::test]
async fn test_engine_failure_on_start_records_error() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.provider.fail("start_container");

    let result = h.manager.start_sandbox(&sandbox.id).await;
    assert!(matches!(result, Err(SandboxError::EngineFailure(_))));

    let failed = h.manager.get_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(failed.status, SandboxStatus::Error);
    // The container was created before the start failed and is kept for the retry
    assert_eq!(failed.container_id.as_deref(), Some("ctr-1"));

    h.provider.recover("start_container");
    let retried = h.manager.start_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(retried.status, SandboxStatus::Running);
    assert_eq!(retried.error_message, None);
    assert_eq!(h.provider.call_count("create_container"), 1);
}

#[tokio::test]
async fn test_start_running_sandbox_is_invalid_state() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    let result = h.manager.start_sandbox(&sandbox.id).await;

    assert!(matches!(result, Err(SandboxError::InvalidState(_))));
    assert_eq!(h.provider.call_count("start_container"), 1);
}

#[tokio::test]
async fn test_stop_stopped_sandbox_never_calls_engine() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let stopped = h.manager.stop_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_stop_then_start_reuses_container() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    let stopped = h.manager.stop_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert!(stopped.stopped_at.is_some());

    let restarted = h.manager.start_sandbox(&sandbox.id).await.unwrap();
    assert_eq!(restarted.status, SandboxStatus::Running);
    assert_eq!(restarted.container_id.as_deref(), Some("ctr-1"));
    assert_eq!(h.provider.call_count("create_container"), 1);
    assert_eq!(h.provider.call_count("start_container"), 2);
}

#[tokio::test]
async fn test_stop_failure_records_error() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();
    h.provider.fail("stop_container");

    let result = h.manager.stop_sandbox(&sandbox.id).await;

    assert!(matches!(result, Err(SandboxError::EngineFailure(_))));
    assert_eq!(
        h.manager.get_sandbox(&sandbox.id).await.unwrap().status,
        SandboxStatus::Error
    );
}

#[tokio::test]
async fn test_restart_without_container_degrades_to_start() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let restarted = h.manager.restart_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(restarted.status, SandboxStatus::Running);
    assert_eq!(h.provider.call_count("create_container"), 1);
    assert_eq!(h.provider.call_count("restart_container"), 0);
}

#[tokio::test]
async fn test_restart_with_container() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    let restarted = h.manager.restart_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(restarted.status, SandboxStatus::Running);
    assert_eq!(h.provider.call_count("restart_container"), 1);
}

#[tokio::test]
async fn test_status_events_are_published() {
    let h = harness().await;
    let mut events = h.manager.subscribe();
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(events.recv().await.unwrap().status, SandboxStatus::Starting);
    assert_eq!(events.recv().await.unwrap().status, SandboxStatus::Running);
}

#[tokio::test]
async fn test_concurrent_starts_are_serialized() {
    let h = harness().await;
    h.provider.set_start_delay(Duration::from_millis(50));
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let first = {
        let manager = h.manager.clone();
        let id = sandbox.id.clone();
        tokio::spawn(async move { manager.start_sandbox(&id).await })
    };
    let second = {
        let manager = h.manager.clone();
        let id = sandbox.id.clone();
        tokio::spawn(async move { manager.start_sandbox(&id).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];

    // Exactly one start wins; the other observes the running state
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(SandboxError::InvalidState(_)))));
    assert_eq!(h.provider.max_concurrent_starts(), 1);
    assert_eq!(h.provider.call_count("create_container"), 1);
}

#[tokio::test]
async fn test_different_sandboxes_start_concurrently() {
    let h = harness().await;
    h.provider.set_start_delay(Duration::from_millis(200));
    let a = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    let b = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let started = tokio::time::Instant::now();
    let (first, second) = tokio::join!(
        h.manager.start_sandbox(&a.id),
        h.manager.start_sandbox(&b.id)
    );

    assert_eq!(first.unwrap().status, SandboxStatus::Running);
    assert_eq!(second.unwrap().status, SandboxStatus::Running);
    // Neither waited for the other's engine call
    assert_eq!(h.provider.max_concurrent_starts(), 2);
    assert!(started.elapsed() < Duration::from_millis(390));
}

#[tokio::test]
async fn test_delete_cleans_up_everything() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();
    h.logs
        .insert(
            &sandbox.id,
            &LogEntry {
                timestamp: chrono::Utc::now(),
                stream: LogStream::Stdout,
                message: "hello".to_string(),
            },
        )
        .await
        .unwrap();

    let report = h.manager.delete_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(report.container, CleanupOutcome::Done);
    assert_eq!(report.network, CleanupOutcome::Done);
    assert_eq!(report.logs_removed, 1);
    assert!(h.provider.networks().is_empty());
    assert!(matches!(
        h.manager.get_sandbox(&sandbox.id).await,
        Err(SandboxError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_delete_swallows_cleanup_failures() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    h.manager.start_sandbox(&sandbox.id).await.unwrap();
    h.provider.fail("stop_container");
    h.provider.fail("remove_container");
    h.provider.fail("remove_network");

    let report = h.manager.delete_sandbox(&sandbox.id).await.unwrap();

    assert!(report.container.is_failed());
    assert!(report.network.is_failed());
    assert!(h.storage.get_sandbox(&sandbox.id).await.is_err());
}

#[tokio::test]
async fn test_delete_never_started_sandbox() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let report = h.manager.delete_sandbox(&sandbox.id).await.unwrap();

    assert_eq!(report.container, CleanupOutcome::Skipped);
    assert_eq!(report.network, CleanupOutcome::Skipped);
    assert_eq!(h.provider.call_count("remove_container"), 0);
}

#[tokio::test]
async fn test_config_changes_flag_restart_only_when_running() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let change = h
        .manager
        .set_env_var(&sandbox.id, "EDITOR", "vim")
        .await
        .unwrap();
    assert!(!change.restart_required);

    h.manager.start_sandbox(&sandbox.id).await.unwrap();
    let change = h
        .manager
        .add_port_mapping(
            &sandbox.id,
            PortBinding {
                host_port: 13000,
                container_port: 3000,
                protocol: "tcp".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(change.restart_required);

    let duplicate = h
        .manager
        .add_port_mapping(
            &sandbox.id,
            PortBinding {
                host_port: 13001,
                container_port: 3000,
                protocol: "tcp".to_string(),
            },
        )
        .await;
    assert!(matches!(duplicate, Err(SandboxError::Conflict(_))));

    let keys: Vec<String> = h
        .manager
        .list_env_vars(&sandbox.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(keys, vec!["EDITOR".to_string(), "RUST_LOG".to_string()]);
}

#[tokio::test]
async fn test_exec_requires_running_sandbox() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    let result = h
        .manager
        .exec(&sandbox.id, ExecRequest::new(["echo", "hi"]))
        .await;
    assert!(matches!(result, Err(SandboxError::InvalidState(_))));

    h.manager.start_sandbox(&sandbox.id).await.unwrap();
    h.provider.set_exec_result(0, "hi\n");
    let output = h
        .manager
        .exec(&sandbox.id, ExecRequest::new(["echo", "hi"]))
        .await
        .unwrap();
    assert_eq!(output.stdout, b"hi\n".to_vec());
    assert_eq!(
        h.provider.execs()[0].working_dir.as_deref(),
        Some("/workspace")
    );
}

#[tokio::test]
async fn test_container_info_and_stats() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();
    assert!(matches!(
        h.manager.container_info(&sandbox.id).await,
        Err(SandboxError::InvalidState(_))
    ));

    h.manager.start_sandbox(&sandbox.id).await.unwrap();

    let info = h.manager.container_info(&sandbox.id).await.unwrap();
    assert_eq!(info.ports.get(&8080), Some(&18080));
    let stats = h.manager.container_stats(&sandbox.id).await.unwrap();
    assert_eq!(stats.memory_limit_mb, 2048);
}

#[tokio::test]
async fn test_drain_rejects_new_operations() {
    let h = harness().await;
    let sandbox = h.manager.create_sandbox(request("ubuntu:22.04")).await.unwrap();

    h.manager.drain().await;

    assert!(matches!(
        h.manager.start_sandbox(&sandbox.id).await,
        Err(SandboxError::ShuttingDown)
    ));
    assert!(matches!(
        h.manager.create_sandbox(request("ubuntu:22.04")).await,
        Err(SandboxError::ShuttingDown)
    ));
}
