// ABOUTME: Log retention engine bounding stored logs by age and per-sandbox byte budget
// ABOUTME: Runs both passes as aggregate queries so no full row set is loaded

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::log_store::LogStore;
use crate::storage::Result;

pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;
pub const DEFAULT_MAX_BYTES_PER_SANDBOX: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_bytes_per_sandbox: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
            max_bytes_per_sandbox: DEFAULT_MAX_BYTES_PER_SANDBOX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub expired_deleted: u64,
    pub over_budget_deleted: u64,
    pub bytes_freed: u64,
}

pub struct RetentionEngine {
    store: Arc<LogStore>,
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(store: Arc<LogStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run the age pass then the budget pass
    pub async fn run_cleanup(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        let cutoff = Utc::now() - self.policy.max_age;
        let expired = self.store.delete_older_than(cutoff).await?;
        report.expired_deleted = expired.entries;
        report.bytes_freed += expired.bytes;

        let budget = self.policy.max_bytes_per_sandbox;
        for (sandbox_id, total) in self.store.sandboxes_over_budget(budget).await? {
            let excess = total - budget;
            let evicted = self.store.evict_oldest(&sandbox_id, excess).await?;
            debug!(
                "Evicted {} log entries ({} bytes) from sandbox {} over budget by {} bytes",
                evicted.entries, evicted.bytes, sandbox_id, excess
            );
            report.over_budget_deleted += evicted.entries;
            report.bytes_freed += evicted.bytes;
        }

        if report.expired_deleted > 0 || report.over_budget_deleted > 0 {
            info!(
                "Log retention removed {} expired and {} over-budget entries ({} bytes)",
                report.expired_deleted, report.over_budget_deleted, report.bytes_freed
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{LogEntry, LogStream};
    use crate::storage::tests::{setup_test_db, test_sandbox};
    use crate::storage::SandboxStorage;
    use pretty_assertions::assert_eq;

    const MIB: usize = 1024 * 1024;

    async fn setup(policy: RetentionPolicy) -> (RetentionEngine, Arc<LogStore>, String) {
        let pool = setup_test_db().await;
        let sandbox = SandboxStorage::new(pool.clone())
            .create_sandbox(test_sandbox("Retention"), vec![], vec![])
            .await
            .unwrap();
        let store = Arc::new(LogStore::new(pool));
        (RetentionEngine::new(store.clone(), policy), store, sandbox.id)
    }

    #[tokio::test]
    async fn test_budget_pass_deletes_minimal_oldest_prefix() {
        let (engine, store, sandbox_id) = setup(RetentionPolicy::default()).await;
        let start = Utc::now() - Duration::hours(1);

        // 25 one-MiB entries against a 20 MiB budget
        let entries: Vec<LogEntry> = (0..25)
            .map(|i| LogEntry {
                timestamp: start + Duration::seconds(i),
                stream: LogStream::Stdout,
                message: char::from(b'a' + i as u8).to_string().repeat(MIB),
            })
            .collect();
        store.insert_batch(&sandbox_id, &entries).await.unwrap();

        let report = engine.run_cleanup().await.unwrap();

        assert_eq!(
            report,
            RetentionReport {
                expired_deleted: 0,
                over_budget_deleted: 5,
                bytes_freed: 5 * MIB as u64,
            }
        );
        assert_eq!(
            store.sandbox_log_bytes(&sandbox_id).await.unwrap(),
            20 * MIB as u64
        );

        let oldest = store
            .get_logs(
                &sandbox_id,
                &crate::log_store::LogQuery {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(oldest.entries[0].message.starts_with('f'));
    }

    #[tokio::test]
    async fn test_budget_pass_does_not_over_delete() {
        let (engine, store, sandbox_id) = setup(RetentionPolicy {
            max_bytes_per_sandbox: 10,
            ..Default::default()
        })
        .await;
        let now = Utc::now();

        // Sizes 3, 6, 6: total 15, excess 5 needs the first two
        let entries: Vec<LogEntry> = ["abc", "defghi", "jklmno"]
            .iter()
            .enumerate()
            .map(|(i, m)| LogEntry {
                timestamp: now + Duration::milliseconds(i as i64),
                stream: LogStream::Stderr,
                message: m.to_string(),
            })
            .collect();
        store.insert_batch(&sandbox_id, &entries).await.unwrap();

        let report = engine.run_cleanup().await.unwrap();
        assert_eq!(report.over_budget_deleted, 2);
        assert_eq!(report.bytes_freed, 9);
        assert_eq!(store.sandbox_log_bytes(&sandbox_id).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_age_pass() {
        let (engine, store, sandbox_id) = setup(RetentionPolicy::default()).await;
        store
            .insert_batch(
                &sandbox_id,
                &[
                    LogEntry {
                        timestamp: Utc::now() - Duration::days(8),
                        stream: LogStream::Stdout,
                        message: "ancient".to_string(),
                    },
                    LogEntry {
                        timestamp: Utc::now(),
                        stream: LogStream::Stdout,
                        message: "recent".to_string(),
                    },
                ],
            )
            .await
            .unwrap();

        let report = engine.run_cleanup().await.unwrap();
        assert_eq!(report.expired_deleted, 1);
        assert_eq!(report.over_budget_deleted, 0);
        assert_eq!(report.bytes_freed, 7);
    }

    #[tokio::test]
    async fn test_nothing_to_do() {
        let (engine, _store, _sandbox_id) = setup(RetentionPolicy::default()).await;
        assert_eq!(
            engine.run_cleanup().await.unwrap(),
            RetentionReport::default()
        );
    }
}
