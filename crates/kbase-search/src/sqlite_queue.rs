use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbase_core::{EntryKey, KbaseError, KbaseResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{
    EmbeddingQueue, EnqueueOutcome, ItemStatus, QueueItem, QueuePolicy, QueueStatus,
    RetryOutcome,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embedding_queue (
    collection  TEXT    NOT NULL,
    entry_id    TEXT    NOT NULL,
    status      TEXT    NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    queued_at   INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    claimed_by  TEXT,
    retry_at    INTEGER,
    PRIMARY KEY (collection, entry_id)
);
CREATE INDEX IF NOT EXISTS idx_embedding_queue_claim
    ON embedding_queue (status, queued_at);
";

const ITEM_COLUMNS: &str =
    "collection, entry_id, status, attempts, last_error, queued_at, updated_at, retry_at";

/// SQLite-backed queue that survives restarts.
///
/// Every transition runs inside an immediate transaction, so several
/// processes sharing one database file never claim the same item twice.
pub struct SqliteEmbeddingQueue {
    conn: Mutex<Connection>,
    policy: QueuePolicy,
    /// Recorded in `claimed_by` for diagnostics.
    worker_id: String,
}

impl SqliteEmbeddingQueue {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path, policy: QueuePolicy) -> KbaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sql_err)?;
        Self::init(conn, policy)
    }

    /// A private in-memory database, for tests and one-shot runs.
    pub fn open_in_memory(policy: QueuePolicy) -> KbaseResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn, policy)
    }

    fn init(conn: Connection, policy: QueuePolicy) -> KbaseResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        add_retry_column(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy: QueuePolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            worker_id: Uuid::new_v4().to_string(),
        })
    }
}

/// Databases created before backoff existed lack the `retry_at` column.
fn add_retry_column(conn: &Connection) -> KbaseResult<()> {
    let present: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('embedding_queue') WHERE name = 'retry_at'",
            [],
            |row| row.get(0),
        )
        .map_err(sql_err)?;
    if present == 0 {
        conn.execute_batch("ALTER TABLE embedding_queue ADD COLUMN retry_at INTEGER")
            .map_err(sql_err)?;
    }
    Ok(())
}

fn sql_err(e: rusqlite::Error) -> KbaseError {
    KbaseError::Storage(format!("SQLite: {e}"))
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<(QueueItem, String)> {
    let status: String = row.get(2)?;
    let attempts: i64 = row.get(3)?;
    Ok((
        QueueItem {
            key: EntryKey::new(row.get::<_, String>(1)?, row.get::<_, String>(0)?),
            status: ItemStatus::Pending,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            last_error: row.get(4)?,
            queued_at: from_micros(row.get(5)?),
            updated_at: from_micros(row.get(6)?),
            retry_at: row.get::<_, Option<i64>>(7)?.map(from_micros),
        },
        status,
    ))
}

/// Finish decoding a row whose status column was read as text.
fn with_status((mut item, status): (QueueItem, String)) -> KbaseResult<QueueItem> {
    item.status = status.parse()?;
    Ok(item)
}

#[async_trait]
impl EmbeddingQueue for SqliteEmbeddingQueue {
    async fn enqueue(&self, key: &EntryKey) -> KbaseResult<EnqueueOutcome> {
        let now = now_micros();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM embedding_queue WHERE collection = ?1 AND entry_id = ?2",
                params![key.collection, key.entry_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;

        let outcome = match current.as_deref().map(str::parse::<ItemStatus>).transpose()? {
            None => {
                tx.execute(
                    "INSERT INTO embedding_queue
                        (collection, entry_id, status, attempts, queued_at, updated_at)
                     VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
                    params![key.collection, key.entry_id, now],
                )
                .map_err(sql_err)?;
                EnqueueOutcome::Inserted
            }
            Some(ItemStatus::Pending | ItemStatus::Processing) => EnqueueOutcome::Coalesced,
            Some(ItemStatus::Done | ItemStatus::Failed) => {
                tx.execute(
                    "UPDATE embedding_queue
                     SET status = 'pending', attempts = 0, last_error = NULL,
                         queued_at = ?3, updated_at = ?3, claimed_by = NULL, retry_at = NULL
                     WHERE collection = ?1 AND entry_id = ?2",
                    params![key.collection, key.entry_id, now],
                )
                .map_err(sql_err)?;
                EnqueueOutcome::Reset
            }
        };
        tx.commit().map_err(sql_err)?;
        Ok(outcome)
    }

    async fn claim_batch(&self, n: usize) -> KbaseResult<Vec<QueueItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let now = now_micros();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let mut claimed = {
            let mut stmt = tx
                .prepare(&format!(
                    "UPDATE embedding_queue
                     SET status = 'processing', updated_at = ?1, claimed_by = ?2
                     WHERE rowid IN (
                         SELECT rowid FROM embedding_queue
                         WHERE status = 'pending' AND (retry_at IS NULL OR retry_at <= ?1)
                         ORDER BY queued_at, rowid
                         LIMIT ?3
                     )
                     RETURNING {ITEM_COLUMNS}"
                ))
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![now, self.worker_id, limit], row_to_item)
                .map_err(sql_err)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(with_status(row.map_err(sql_err)?)?);
            }
            items
        };
        tx.commit().map_err(sql_err)?;

        claimed.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.key.cmp(&b.key)));
        debug!(
            worker_id = %self.worker_id,
            requested = n,
            claimed = claimed.len(),
            "Claimed embedding batch"
        );
        Ok(claimed)
    }

    async fn mark_done(&self, key: &EntryKey) -> KbaseResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE embedding_queue
             SET status = 'done', last_error = NULL, updated_at = ?3, claimed_by = NULL
             WHERE collection = ?1 AND entry_id = ?2 AND status = 'processing'",
            params![key.collection, key.entry_id, now_micros()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn mark_retry(&self, key: &EntryKey, error: &str) -> KbaseResult<RetryOutcome> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, attempts FROM embedding_queue
                 WHERE collection = ?1 AND entry_id = ?2",
                params![key.collection, key.entry_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;

        let Some((status, attempts)) = current else {
            return Ok(RetryOutcome::Missing);
        };
        let status: ItemStatus = status.parse()?;
        if status != ItemStatus::Processing {
            return Err(KbaseError::Storage(format!(
                "cannot retry {key}: item is {status}"
            )));
        }

        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX).saturating_add(1);
        let (next, retry_at, outcome) = if attempts < self.policy.max_attempts {
            let retry_at = self.policy.retry_at(now, attempts).timestamp_micros();
            (ItemStatus::Pending, Some(retry_at), RetryOutcome::Requeued { attempts })
        } else {
            (ItemStatus::Failed, None, RetryOutcome::Failed { attempts })
        };
        tx.execute(
            "UPDATE embedding_queue
             SET status = ?3, attempts = ?4, last_error = ?5, updated_at = ?6,
                 claimed_by = NULL, retry_at = ?7
             WHERE collection = ?1 AND entry_id = ?2",
            params![
                key.collection,
                key.entry_id,
                next.as_str(),
                i64::from(attempts),
                error,
                now.timestamp_micros(),
                retry_at
            ],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(outcome)
    }

    async fn release(&self, key: &EntryKey) -> KbaseResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE embedding_queue
             SET status = 'pending', updated_at = ?3, claimed_by = NULL
             WHERE collection = ?1 AND entry_id = ?2 AND status = 'processing'",
            params![key.collection, key.entry_id, now_micros()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn recover_stale(&self) -> KbaseResult<usize> {
        let now = Utc::now();
        let cutoff = self.policy.stale_cutoff(now).timestamp_micros();
        let conn = self.conn.lock();
        let moved = conn
            .execute(
                "UPDATE embedding_queue
                 SET status = 'pending', updated_at = ?1, claimed_by = NULL, retry_at = NULL
                 WHERE status = 'processing' AND updated_at <= ?2",
                params![now.timestamp_micros(), cutoff],
            )
            .map_err(sql_err)?;
        if moved > 0 {
            warn!(
                worker_id = %self.worker_id,
                recovered = moved,
                cutoff_micros = cutoff,
                "Reclaimed expired embedding claims"
            );
        }
        Ok(moved)
    }

    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM embedding_queue WHERE collection = ?1 AND entry_id = ?2",
                params![key.collection, key.entry_id],
            )
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> KbaseResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM embedding_queue", [])
            .map_err(sql_err)?;
        Ok(())
    }

    async fn status_summary(&self) -> KbaseResult<QueueStatus> {
        let conn = self.conn.lock();
        let mut status = QueueStatus::default();
        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM embedding_queue GROUP BY status")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql_err)?;
            for row in rows {
                let (name, count) = row.map_err(sql_err)?;
                let count = usize::try_from(count).unwrap_or(0);
                match name.parse::<ItemStatus>()? {
                    ItemStatus::Pending => status.pending = count,
                    ItemStatus::Processing => status.processing = count,
                    ItemStatus::Done => status.done = count,
                    ItemStatus::Failed => status.failed = count,
                }
            }
        }
        status.last_error = conn
            .query_row(
                "SELECT last_error FROM embedding_queue
                 WHERE last_error IS NOT NULL
                 ORDER BY updated_at DESC, rowid DESC
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(status)
    }

    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<QueueItem>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM embedding_queue
                     WHERE collection = ?1 AND entry_id = ?2"
                ),
                params![key.collection, key.entry_id],
                row_to_item,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(with_status).transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(id: &str) -> EntryKey {
        EntryKey::new(id, "docs")
    }

    fn immediate() -> QueuePolicy {
        QueuePolicy {
            claim_timeout: Duration::ZERO,
            retry_base_delay: Duration::ZERO,
            ..QueuePolicy::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_outcomes() {
        let queue = SqliteEmbeddingQueue::open_in_memory(QueuePolicy::default()).unwrap();
        assert_eq!(queue.enqueue(&key("a")).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(queue.enqueue(&key("a")).await.unwrap(), EnqueueOutcome::Coalesced);

        let claimed = queue.claim_batch(5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ItemStatus::Processing);
        assert_eq!(queue.enqueue(&key("a")).await.unwrap(), EnqueueOutcome::Coalesced);

        queue.mark_done(&key("a")).await.unwrap();
        assert_eq!(queue.status_summary().await.unwrap().done, 1);
        assert_eq!(queue.enqueue(&key("a")).await.unwrap(), EnqueueOutcome::Reset);
    }

    #[tokio::test]
    async fn test_exactly_three_attempts_then_failed() {
        let queue = SqliteEmbeddingQueue::open_in_memory(immediate()).unwrap();
        queue.enqueue(&key("a")).await.unwrap();

        let mut attempts = 0;
        let mut last = RetryOutcome::Missing;
        while !queue.claim_batch(1).await.unwrap().is_empty() {
            attempts += 1;
            last = queue.mark_retry(&key("a"), "timeout").await.unwrap();
        }
        assert_eq!(attempts, 3);
        assert_eq!(last, RetryOutcome::Failed { attempts: 3 });

        let item = queue.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("timeout"));

        let status = queue.status_summary().await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen_and_recovers_processing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.sqlite3");
        {
            let queue = SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap();
            queue.enqueue(&key("a")).await.unwrap();
            queue.enqueue(&key("b")).await.unwrap();
            queue.claim_batch(1).await.unwrap();
        }

        let queue = SqliteEmbeddingQueue::open(&path, immediate()).unwrap();
        let status = queue.status_summary().await.unwrap();
        assert_eq!((status.pending, status.processing), (1, 1));

        assert_eq!(queue.recover_stale().await.unwrap(), 1);
        let claimed = queue.claim_batch(10).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|i| i.key.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_second_handle_cannot_steal_live_claims() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.sqlite3");
        let first = SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap();
        let second = SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap();
        for id in ["a", "b", "c"] {
            first.enqueue(&key(id)).await.unwrap();
        }
        assert_eq!(first.claim_batch(10).await.unwrap().len(), 3);

        assert_eq!(second.recover_stale().await.unwrap(), 0);
        assert!(second.claim_batch(10).await.unwrap().is_empty());
        assert_eq!(second.status_summary().await.unwrap().processing, 3);

        first.mark_done(&key("a")).await.unwrap();
        assert_eq!(first.status_summary().await.unwrap().done, 1);

        // With a zero claim timeout the remaining claims count as abandoned.
        let rescuer = SqliteEmbeddingQueue::open(&path, immediate()).unwrap();
        assert_eq!(rescuer.recover_stale().await.unwrap(), 2);
        let ids: Vec<String> = rescuer
            .claim_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key.entry_id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_retry_is_deferred_until_backoff_elapses() {
        let queue = SqliteEmbeddingQueue::open_in_memory(QueuePolicy {
            retry_base_delay: Duration::from_secs(3600),
            ..QueuePolicy::default()
        })
        .unwrap();
        queue.enqueue(&key("a")).await.unwrap();
        queue.claim_batch(1).await.unwrap();
        assert_eq!(
            queue.mark_retry(&key("a"), "429 Too Many Requests").await.unwrap(),
            RetryOutcome::Requeued { attempts: 1 }
        );

        assert!(queue.claim_batch(10).await.unwrap().is_empty());
        let item = queue.get(&key("a")).await.unwrap().unwrap();
        assert_eq!((item.status, item.attempts), (ItemStatus::Pending, 1));
        assert!(item.retry_at.unwrap() > Utc::now() + chrono::Duration::minutes(59));

        // Enqueueing again coalesces and keeps the backoff.
        assert_eq!(queue.enqueue(&key("a")).await.unwrap(), EnqueueOutcome::Coalesced);
        assert!(queue.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_opens_database_without_retry_column() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.sqlite3");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE embedding_queue (
                    collection TEXT NOT NULL, entry_id TEXT NOT NULL, status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0, last_error TEXT,
                    queued_at INTEGER NOT NULL, updated_at INTEGER NOT NULL, claimed_by TEXT,
                    PRIMARY KEY (collection, entry_id));
                 INSERT INTO embedding_queue VALUES ('docs', 'old', 'pending', 0, NULL, 1, 1, NULL);",
            )
            .unwrap();
        }
        let queue = SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap();
        let claimed = queue.claim_batch(5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_at, None);
    }

    #[tokio::test]
    async fn test_release_remove_clear() {
        let queue = SqliteEmbeddingQueue::open_in_memory(QueuePolicy::default()).unwrap();
        queue.enqueue(&key("a")).await.unwrap();
        queue.enqueue(&key("b")).await.unwrap();
        queue.claim_batch(2).await.unwrap();

        queue.release(&key("a")).await.unwrap();
        let a = queue.get(&key("a")).await.unwrap().unwrap();
        assert_eq!((a.status, a.attempts), (ItemStatus::Pending, 0));

        assert!(queue.remove(&key("b")).await.unwrap());
        assert_eq!(
            queue.mark_retry(&key("b"), "gone").await.unwrap(),
            RetryOutcome::Missing
        );

        queue.clear().await.unwrap();
        assert_eq!(queue.status_summary().await.unwrap(), QueueStatus::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_across_connections() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.sqlite3");
        let seed = SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap();
        for i in 0..60 {
            seed.enqueue(&key(&format!("e{i:02}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::new(SqliteEmbeddingQueue::open(&path, QueuePolicy::default()).unwrap());
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = queue.claim_batch(4).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|i| i.key));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.await.unwrap() {
                assert!(seen.insert(key.clone()), "{key} claimed twice");
            }
        }
        assert_eq!(seen.len(), 60);
    }
}
