// ABOUTME: Append-only store for container log entries with history queries
// ABOUTME: Exposes aggregate size queries and oldest-first eviction used by retention

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::demux::{LogEntry, LogStream};
use crate::storage::{format_timestamp, parse_timestamp, Result, StorageError};

/// Default page size for history queries
pub const DEFAULT_LOG_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredLogEntry {
    pub id: i64,
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LogQuery {
    pub stream: Option<LogStream>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            stream: None,
            since: None,
            limit: DEFAULT_LOG_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub entries: Vec<StoredLogEntry>,
    /// Matching entries ignoring limit and offset
    pub total: i64,
}

/// Rows and bytes removed by a delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub entries: u64,
    pub bytes: u64,
}

pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, sandbox_id: &str, entry: &LogEntry) -> Result<()> {
        self.insert_batch(sandbox_id, std::slice::from_ref(entry))
            .await
    }

    /// Insert many entries in a single transaction
    pub async fn insert_batch(&self, sandbox_id: &str, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO sandbox_logs (sandbox_id, timestamp, stream, message)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(sandbox_id)
            .bind(format_timestamp(&entry.timestamp))
            .bind(entry.stream.as_str())
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Page through a sandbox's history in ascending time order
    pub async fn get_logs(&self, sandbox_id: &str, query: &LogQuery) -> Result<LogPage> {
        let mut filter = String::from("WHERE sandbox_id = ?1");
        let mut param_count = 1;
        if query.stream.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND stream = ?{}", param_count));
        }
        if query.since.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND timestamp >= ?{}", param_count));
        }

        let count_sql = format!("SELECT COUNT(*) AS total FROM sandbox_logs {}", filter);
        let page_sql = format!(
            "SELECT id, sandbox_id, timestamp, stream, message FROM sandbox_logs {} \
             ORDER BY timestamp ASC, id ASC LIMIT ?{} OFFSET ?{}",
            filter,
            param_count + 1,
            param_count + 2
        );

        let since = query.since.as_ref().map(format_timestamp);

        let mut count = sqlx::query(&count_sql).bind(sandbox_id);
        let mut page = sqlx::query(&page_sql).bind(sandbox_id);
        if let Some(stream) = &query.stream {
            count = count.bind(stream.as_str());
            page = page.bind(stream.as_str());
        }
        if let Some(since) = &since {
            count = count.bind(since.clone());
            page = page.bind(since.clone());
        }

        let total: i64 = count.fetch_one(&self.pool).await?.try_get("total")?;
        let rows = page
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .into_iter()
            .map(|row| self.row_to_entry(row))
            .collect::<Result<Vec<_>>>()?;

        Ok(LogPage { entries, total })
    }

    /// Delete every entry of a sandbox, returning how many were removed
    pub async fn clear_logs(&self, sandbox_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sandbox_logs WHERE sandbox_id = ?1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Stored message size of a sandbox in UTF-8 bytes
    pub async fn sandbox_log_bytes(&self, sandbox_id: &str) -> Result<u64> {
        let bytes: i64 = sqlx::query(
            r#"
            SELECT COALESCE(SUM(LENGTH(CAST(message AS BLOB))), 0) AS bytes
            FROM sandbox_logs
            WHERE sandbox_id = ?1
            "#,
        )
        .bind(sandbox_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("bytes")?;

        Ok(bytes as u64)
    }

    /// Timestamp of the newest stored entry of a sandbox
    pub async fn latest_timestamp(&self, sandbox_id: &str) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = sqlx::query(
            "SELECT MAX(timestamp) AS latest FROM sandbox_logs WHERE sandbox_id = ?1",
        )
        .bind(sandbox_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("latest")?;

        latest.as_deref().map(parse_timestamp).transpose()
    }

    // ========================================================================
    // RETENTION QUERIES
    // ========================================================================

    /// Delete every entry older than `cutoff`
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Removed> {
        let cutoff = format_timestamp(&cutoff);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS entries,
                   COALESCE(SUM(LENGTH(CAST(message AS BLOB))), 0) AS bytes
            FROM sandbox_logs
            WHERE timestamp < ?1
            "#,
        )
        .bind(&cutoff)
        .fetch_one(&mut *tx)
        .await?;
        let bytes: i64 = row.try_get("bytes")?;

        let result = sqlx::query("DELETE FROM sandbox_logs WHERE timestamp < ?1")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Removed {
            entries: result.rows_affected(),
            bytes: bytes as u64,
        })
    }

    /// Sandboxes whose stored size exceeds `budget` bytes, with their current size
    pub async fn sandboxes_over_budget(&self, budget: u64) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT sandbox_id, SUM(LENGTH(CAST(message AS BLOB))) AS bytes
            FROM sandbox_logs
            GROUP BY sandbox_id
            HAVING bytes > ?1
            "#,
        )
        .bind(budget as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("sandbox_id")?,
                    row.try_get::<i64, _>("bytes")? as u64,
                ))
            })
            .collect()
    }

    /// Delete the shortest oldest-first prefix of a sandbox's entries whose size reaches `excess`.
    ///
    /// Entry i is removed when the bytes of the entries before it are still short of `excess`.
    pub async fn evict_oldest(&self, sandbox_id: &str, excess: u64) -> Result<Removed> {
        if excess == 0 {
            return Ok(Removed::default());
        }

        const PREFIX: &str = r#"
            WITH ranked AS (
                SELECT id,
                       LENGTH(CAST(message AS BLOB)) AS size,
                       COALESCE(SUM(LENGTH(CAST(message AS BLOB))) OVER (
                           ORDER BY timestamp ASC, id ASC
                           ROWS BETWEEN UNBOUNDED PRECEDING AND 1 PRECEDING
                       ), 0) AS before
                FROM sandbox_logs
                WHERE sandbox_id = ?1
            )
        "#;

        let mut tx = self.pool.begin().await?;

        let bytes: i64 = sqlx::query(&format!(
            "{} SELECT COALESCE(SUM(size), 0) AS bytes FROM ranked WHERE before < ?2",
            PREFIX
        ))
        .bind(sandbox_id)
        .bind(excess as i64)
        .fetch_one(&mut *tx)
        .await?
        .try_get("bytes")?;

        let result = sqlx::query(&format!(
            "{} DELETE FROM sandbox_logs WHERE id IN (SELECT id FROM ranked WHERE before < ?2)",
            PREFIX
        ))
        .bind(sandbox_id)
        .bind(excess as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Removed {
            entries: result.rows_affected(),
            bytes: bytes as u64,
        })
    }

    fn row_to_entry(&self, row: SqliteRow) -> Result<StoredLogEntry> {
        let stream: String = row.try_get("stream")?;
        Ok(StoredLogEntry {
            id: row.try_get("id")?,
            sandbox_id: row.try_get("sandbox_id")?,
            timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
            stream: stream
                .parse()
                .map_err(|_| StorageError::InvalidStatus(stream.clone()))?,
            message: row.try_get("message")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{setup_test_db, test_sandbox};
    use crate::storage::SandboxStorage;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn setup() -> (LogStore, String) {
        let pool = setup_test_db().await;
        let sandbox = SandboxStorage::new(pool.clone())
            .create_sandbox(test_sandbox("Logs"), vec![], vec![])
            .await
            .unwrap();
        (LogStore::new(pool), sandbox.id)
    }

    fn entry(offset_secs: i64, stream: LogStream, message: &str) -> LogEntry {
        LogEntry {
            timestamp: "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
                + Duration::seconds(offset_secs),
            stream,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_logs_filters_and_pages() {
        let (store, sandbox_id) = setup().await;
        store
            .insert_batch(
                &sandbox_id,
                &[
                    entry(2, LogStream::Stdout, "two"),
                    entry(0, LogStream::Stdout, "zero"),
                    entry(1, LogStream::Stderr, "one"),
                    entry(3, LogStream::Stderr, "three"),
                ],
            )
            .await
            .unwrap();

        let all = store
            .get_logs(&sandbox_id, &LogQuery::default())
            .await
            .unwrap();
        assert_eq!(all.total, 4);
        let messages: Vec<&str> = all.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["zero", "one", "two", "three"]);

        let stderr = store
            .get_logs(
                &sandbox_id,
                &LogQuery {
                    stream: Some(LogStream::Stderr),
                    limit: 1,
                    offset: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stderr.total, 2);
        assert_eq!(stderr.entries.len(), 1);
        assert_eq!(stderr.entries[0].message, "three");

        let since = store
            .get_logs(
                &sandbox_id,
                &LogQuery {
                    since: Some(entry(2, LogStream::Stdout, "").timestamp),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(since.total, 2);
    }

    #[tokio::test]
    async fn test_sizes_are_utf8_bytes() {
        let (store, sandbox_id) = setup().await;
        store
            .insert(&sandbox_id, &entry(0, LogStream::Stdout, "héllo"))
            .await
            .unwrap();

        assert_eq!(store.sandbox_log_bytes(&sandbox_id).await.unwrap(), 6);
        assert_eq!(store.sandbox_log_bytes("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let (store, sandbox_id) = setup().await;
        store
            .insert_batch(
                &sandbox_id,
                &[
                    entry(0, LogStream::Stdout, "a"),
                    entry(1, LogStream::Stdout, "b"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.clear_logs(&sandbox_id).await.unwrap(), 2);
        assert_eq!(store.clear_logs(&sandbox_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_timestamp() {
        let (store, sandbox_id) = setup().await;
        assert_eq!(store.latest_timestamp(&sandbox_id).await.unwrap(), None);

        let newest = entry(5, LogStream::Stderr, "late");
        store
            .insert_batch(
                &sandbox_id,
                &[entry(1, LogStream::Stdout, "early"), newest.clone()],
            )
            .await
            .unwrap();

        assert_eq!(
            store.latest_timestamp(&sandbox_id).await.unwrap(),
            Some(newest.timestamp)
        );
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let (store, sandbox_id) = setup().await;
        store
            .insert_batch(
                &sandbox_id,
                &[
                    entry(0, LogStream::Stdout, "old"),
                    entry(100, LogStream::Stdout, "new"),
                ],
            )
            .await
            .unwrap();

        let removed = store
            .delete_older_than(entry(50, LogStream::Stdout, "").timestamp)
            .await
            .unwrap();
        assert_eq!(
            removed,
            Removed {
                entries: 1,
                bytes: 3
            }
        );
    }

    #[tokio::test]
    async fn test_evict_oldest_removes_minimal_prefix() {
        let (store, sandbox_id) = setup().await;
        // Sizes 4, 4, 4, 4 in time order
        store
            .insert_batch(
                &sandbox_id,
                &[
                    entry(3, LogStream::Stdout, "dddd"),
                    entry(0, LogStream::Stdout, "aaaa"),
                    entry(1, LogStream::Stdout, "bbbb"),
                    entry(2, LogStream::Stdout, "cccc"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            store.sandboxes_over_budget(10).await.unwrap(),
            vec![(sandbox_id.clone(), 16)]
        );

        // Excess of 5 needs two entries (4 is short, 8 reaches it)
        let removed = store.evict_oldest(&sandbox_id, 5).await.unwrap();
        assert_eq!(
            removed,
            Removed {
                entries: 2,
                bytes: 8
            }
        );

        let remaining = store
            .get_logs(&sandbox_id, &LogQuery::default())
            .await
            .unwrap();
        let messages: Vec<&str> = remaining
            .entries
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["cccc", "dddd"]);
        assert!(store.sandboxes_over_budget(10).await.unwrap().is_empty());
    }
}
