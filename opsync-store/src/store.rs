//! Persistent pending-operation store
//!
//! The store is a durable key-value map from operation id to record, plus a
//! small amount of bookkeeping (last successful sync, replay-cycle history,
//! advisory usage accounting). It makes no ordering guarantee - replay
//! ordering belongs to the sync manager.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, StoreError};
use crate::record::{OperationKind, OperationPriority, OperationRecord};
use crate::usage::StorageUsage;

/// Default soft quota for usage reporting (64 MiB). Advisory only.
pub const DEFAULT_SOFT_QUOTA: u64 = 64 * 1024 * 1024;

const LAST_SYNC_KEY: &str = "last_sync";

/// Summary of one finished replay cycle, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub completed: u32,
    pub failed: u32,
    pub dropped: u32,
    pub error: Option<String>,
}

/// Durable persistence contract consumed by the sync engine.
///
/// `put` and `remove` must be atomic per key; the engine's single-cycle
/// invariant provides the rest of the isolation.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Prepare the backing persistence. Idempotent. Fails with
    /// [`StoreError::Unavailable`] when durable storage cannot be provided.
    async fn initialize(&self) -> Result<()>;

    /// Upsert a record keyed by its id. Idempotent.
    async fn put(&self, record: &OperationRecord) -> Result<()>;

    /// Delete a record. No-op if absent.
    async fn remove(&self, id: &str) -> Result<()>;

    /// All currently stored records, in no particular order.
    async fn list_pending(&self) -> Result<Vec<OperationRecord>>;

    /// Number of currently stored records.
    async fn count(&self) -> Result<usize>;

    /// Best-effort usage accounting; zeroed values when unavailable.
    async fn usage(&self) -> Result<StorageUsage>;

    /// Drop all records. Used only by an explicit "reset offline data" action.
    async fn clear(&self) -> Result<()>;

    /// Timestamp of the last successful sync, surviving restarts.
    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()>;

    /// Append a finished replay cycle to the history log.
    async fn record_cycle(&self, cycle: &CycleRecord) -> Result<()>;
}

/// Synchronous SQLite database holding the pending queue.
struct Database {
    conn: Connection,
}

impl Database {
    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Pending operation queue
            CREATE TABLE IF NOT EXISTS pending_operations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            -- Engine bookkeeping (last successful sync, ...)
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Replay cycle history
            CREATE TABLE IF NOT EXISTS cycle_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                dropped INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_pending_priority
                ON pending_operations(priority DESC, created_at ASC);
            "#,
        )?;

        info!("Pending-operation store initialized");
        Ok(())
    }

    fn put(&self, record: &OperationRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;

        self.conn.execute(
            r#"
            INSERT INTO pending_operations
                (id, kind, payload, priority, created_at, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                priority = excluded.priority,
                created_at = excluded.created_at,
                retry_count = excluded.retry_count
            "#,
            params![
                record.id,
                record.kind.as_str(),
                payload,
                record.priority as i64,
                record.created_at.to_rfc3339(),
                record.retry_count,
            ],
        )?;

        debug!("Persisted operation: {}", record.id);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn list_pending(&self) -> Result<Vec<OperationRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, kind, payload, priority, created_at, retry_count
            FROM pending_operations
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, kind, payload, priority, created_at, retry_count) = row?;
            match decode_record(&id, &kind, &payload, priority, &created_at, retry_count) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A corrupt row must not wedge the whole queue.
                    warn!("Skipping unreadable pending operation {}: {}", id, e);
                }
            }
        }

        Ok(records)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    fn used_bytes(&self) -> Result<u64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count.max(0) as u64) * (page_size.max(0) as u64))
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM pending_operations", [])?;
        Ok(())
    }

    fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![LAST_SYNC_KEY, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn record_cycle(&self, cycle: &CycleRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO cycle_history
                (started_at, finished_at, completed, failed, dropped, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                cycle.started_at.to_rfc3339(),
                cycle.finished_at.map(|dt| dt.to_rfc3339()),
                cycle.completed,
                cycle.failed,
                cycle.dropped,
                cycle.error,
            ],
        )?;
        Ok(())
    }

    fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT started_at, finished_at, completed, failed, dropped, error_message
            FROM cycle_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut cycles = Vec::new();
        for row in rows {
            let (started_at, finished_at, completed, failed, dropped, error) = row?;
            let started_at = parse_timestamp("started_at", &started_at)?;
            let finished_at = match finished_at {
                Some(s) => Some(parse_timestamp("finished_at", &s)?),
                None => None,
            };
            cycles.push(CycleRecord {
                started_at,
                finished_at,
                completed,
                failed,
                dropped,
                error,
            });
        }

        Ok(cycles)
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord {
            id: field.to_string(),
            reason: e.to_string(),
        })
}

fn decode_record(
    id: &str,
    kind: &str,
    payload: &str,
    priority: i64,
    created_at: &str,
    retry_count: u32,
) -> Result<OperationRecord> {
    let kind = OperationKind::parse(kind).ok_or_else(|| StoreError::InvalidRecord {
        id: id.to_string(),
        reason: format!("unknown kind '{}'", kind),
    })?;
    let priority =
        OperationPriority::from_i64(priority).ok_or_else(|| StoreError::InvalidRecord {
            id: id.to_string(),
            reason: format!("unknown priority {}", priority),
        })?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| StoreError::InvalidRecord {
            id: id.to_string(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);
    let payload = serde_json::from_str(payload).map_err(|e| StoreError::InvalidRecord {
        id: id.to_string(),
        reason: e.to_string(),
    })?;

    Ok(OperationRecord {
        id: id.to_string(),
        kind,
        payload,
        priority,
        created_at,
        retry_count,
    })
}

/// SQLite-backed [`PendingStore`].
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so the connection lives
/// behind a `tokio::sync::Mutex` and every access goes through the async
/// wrapper.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Database>>,
    quota: u64,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_quota(path, DEFAULT_SOFT_QUOTA)
    }

    /// Open with an explicit soft quota for usage reporting.
    pub fn open_with_quota(path: impl AsRef<Path>, quota: u64) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Database { conn })),
            quota,
        })
    }

    /// In-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Database { conn })),
            quota: DEFAULT_SOFT_QUOTA,
        })
    }

    /// Most recent replay cycles, newest first.
    pub async fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let db = self.inner.lock().await;
        db.recent_cycles(limit)
    }
}

#[async_trait]
impl PendingStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        let db = self.inner.lock().await;
        db.initialize()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn put(&self, record: &OperationRecord) -> Result<()> {
        let db = self.inner.lock().await;
        db.put(record)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let db = self.inner.lock().await;
        db.remove(id)
    }

    async fn list_pending(&self) -> Result<Vec<OperationRecord>> {
        let db = self.inner.lock().await;
        db.list_pending()
    }

    async fn count(&self) -> Result<usize> {
        let db = self.inner.lock().await;
        db.count()
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let db = self.inner.lock().await;
        match db.used_bytes() {
            Ok(used) => Ok(StorageUsage::from_used(used, self.quota)),
            Err(e) => {
                warn!("Storage usage unavailable: {}", e);
                Ok(StorageUsage::unknown())
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        let db = self.inner.lock().await;
        db.clear()
    }

    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.inner.lock().await;
        db.last_sync()
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        let db = self.inner.lock().await;
        db.set_last_sync(at)
    }

    async fn record_cycle(&self, cycle: &CycleRecord) -> Result<()> {
        let db = self.inner.lock().await;
        db.record_cycle(cycle)
    }
}

/// In-memory [`PendingStore`] for engine tests.
///
/// Supports injecting read/write failures to drive the storage-error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<std::sync::Mutex<HashMap<String, OperationRecord>>>,
    last_sync: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
    cycles: Arc<std::sync::Mutex<Vec<CycleRecord>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `list_pending` / `count` fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `put` / `remove` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn recorded_cycles(&self) -> Vec<CycleRecord> {
        self.cycles.lock().expect("cycles lock").clone()
    }

    fn io_error(what: &str) -> StoreError {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {} failure", what),
        ))
    }
}

#[async_trait]
impl PendingStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, record: &OperationRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::io_error("write"));
        }
        self.records
            .lock()
            .expect("records lock")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::io_error("write"));
        }
        self.records.lock().expect("records lock").remove(id);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<OperationRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::io_error("read"));
        }
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .values()
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::io_error("read"));
        }
        Ok(self.records.lock().expect("records lock").len())
    }

    async fn usage(&self) -> Result<StorageUsage> {
        let used: u64 = self
            .records
            .lock()
            .expect("records lock")
            .values()
            .map(|r| serde_json::to_string(r).map(|s| s.len() as u64).unwrap_or(0))
            .sum();
        Ok(StorageUsage::from_used(used, DEFAULT_SOFT_QUOTA))
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().expect("records lock").clear();
        Ok(())
    }

    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_sync.lock().expect("last_sync lock"))
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        *self.last_sync.lock().expect("last_sync lock") = Some(at);
        Ok(())
    }

    async fn record_cycle(&self, cycle: &CycleRecord) -> Result<()> {
        self.cycles.lock().expect("cycles lock").push(cycle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: OperationKind, priority: OperationPriority) -> OperationRecord {
        OperationRecord::new(kind, json!({"title": "test"}), priority)
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        let mut rec = record(OperationKind::Create, OperationPriority::Medium);
        store.put(&rec).await.unwrap();
        store.put(&rec).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        rec.retry_count = 2;
        store.put(&rec).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        store.remove("op_does_not_exist").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        let rec = OperationRecord::new(
            OperationKind::Delete,
            json!({"task_id": 42, "nested": {"a": [1, 2, 3]}}),
            OperationPriority::High,
        );
        store.put(&rec).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        let loaded = &pending[0];
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.kind, rec.kind);
        assert_eq!(loaded.priority, rec.priority);
        assert_eq!(loaded.payload, rec.payload);
        assert_eq!(loaded.retry_count, 0);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            rec.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        for _ in 0..5 {
            store
                .put(&record(OperationKind::Update, OperationPriority::Low))
                .await
                .unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 5);

        store.clear().await.unwrap();
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        assert_eq!(store.last_sync().await.unwrap(), None);

        let at = Utc::now();
        store.set_last_sync(at).await.unwrap();
        let loaded = store.last_sync().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp_millis(), at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_cycle_history_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        for completed in 0..3 {
            store
                .record_cycle(&CycleRecord {
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    completed,
                    failed: 0,
                    dropped: 0,
                    error: None,
                })
                .await
                .unwrap();
        }

        let cycles = store.recent_cycles(2).await.unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].completed, 2);
        assert_eq!(cycles[1].completed, 1);
    }

    #[tokio::test]
    async fn test_usage_reports_nonzero_for_populated_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().await.unwrap();

        store
            .put(&record(OperationKind::Create, OperationPriority::Medium))
            .await
            .unwrap();

        let usage = store.usage().await.unwrap();
        assert!(usage.used > 0);
        assert_eq!(usage.quota, DEFAULT_SOFT_QUOTA);
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        store
            .put(&record(OperationKind::Create, OperationPriority::Low))
            .await
            .unwrap();

        store.set_fail_reads(true);
        assert!(store.list_pending().await.is_err());

        store.set_fail_reads(false);
        assert_eq!(store.list_pending().await.unwrap().len(), 1);
    }
}
