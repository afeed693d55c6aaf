//! Durable SQLite store for offline exam records
//!
//! Provides:
//! - One append-mostly table per collection with never-reused local ids
//! - Per-call transactions so a crash never exposes a half-written record
//! - Delivery bookkeeping for the sync engine (in-flight, backoff, dead letters)
//! - A storage budget that evicts old media snapshots before refusing writes
//! - Recovery of deliveries interrupted by a crash

use crate::config::StoreConfig;
use crate::error::{StorageFailure, SyncError, SyncResult};
use crate::record::{Collection, NewRecord, Record, RecordPayload, SyncState};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "local_id, saved_at, payload, blob, sync_state, attempts, \
                              next_attempt_at, last_error, size_bytes";

/// Result of a successful append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    /// Id assigned to the new record
    pub local_id: i64,
    /// Media snapshots evicted to make room, oldest first
    pub evicted_media: Vec<i64>,
}

/// Per-collection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
    pub bytes: u64,
    pub oldest_saved_at: Option<DateTime<Utc>>,
}

impl CollectionStats {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.dead_lettered
    }
}

/// Snapshot of the whole queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub collections: BTreeMap<Collection, CollectionStats>,
}

impl StoreStats {
    pub fn total_records(&self) -> u64 {
        self.collections.values().map(CollectionStats::total).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.collections.values().map(|c| c.bytes).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.collections.values().map(|c| c.dead_lettered).sum()
    }
}

/// Durable store handle
pub struct DurableStore {
    pool: SqlitePool,
    node_id: Uuid,
    max_storage_bytes: u64,
    max_record_age: Duration,
    // Serializes writers so read-then-write transactions never race a
    // concurrent commit on another pooled connection.
    write_lock: Mutex<()>,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(collection: Collection, local_id: i64, raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(collection, local_id, format!("Invalid timestamp: {}", e)))
}

fn corrupt(collection: Collection, local_id: i64, reason: String) -> SyncError {
    SyncError::Storage(StorageFailure::Corrupt {
        collection,
        local_id,
        reason,
    })
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl DurableStore {
    /// Open (or create) the store and recover interrupted deliveries.
    pub async fn open(config: &StoreConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                StorageFailure::Unavailable(format!("Cannot open {}: {}", config.db_path, e))
            })?;

        Self::initialize_schema(&pool).await?;
        let node_id = Self::load_node_id(&pool).await?;

        let store = Self {
            pool,
            node_id,
            max_storage_bytes: config.max_storage_bytes,
            max_record_age: config.max_record_age,
            write_lock: Mutex::new(()),
        };

        let recovered = store.recover_in_flight().await?;

        tracing::info!(
            db_path = %config.db_path,
            node_id = %node_id,
            recovered,
            "Opened durable exam store"
        );

        Ok(store)
    }

    /// Initialize database schema
    async fn initialize_schema(pool: &SqlitePool) -> SyncResult<()> {
        for collection in Collection::DRAIN_ORDER {
            let table = collection.table();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    saved_at TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    blob BLOB,
                    group_key TEXT,
                    seq INTEGER,
                    sync_state TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_attempt_at TEXT,
                    last_error TEXT,
                    size_bytes INTEGER NOT NULL
                )
                "#
            ))
            .execute(pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_state ON {table}(sync_state, local_id)"
            ))
            .execute(pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_group ON {table}(group_key, seq)"
            ))
            .execute(pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_progress (
                recording_session_id TEXT PRIMARY KEY,
                last_index INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_node_id(pool: &SqlitePool) -> SyncResult<Uuid> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO store_metadata (key, value, updated_at)
            VALUES ('node_id', ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(format_ts(&Utc::now()))
        .execute(pool)
        .await?;

        let row = sqlx::query("SELECT value FROM store_metadata WHERE key = 'node_id'")
            .fetch_one(pool)
            .await?;
        let raw: String = row.try_get("value")?;

        Uuid::parse_str(&raw).map_err(|e| {
            SyncError::Storage(StorageFailure::Unavailable(format!(
                "Invalid node id in store metadata: {}",
                e
            )))
        })
    }

    /// Reset records a crash left in flight. Their attempt was already counted.
    async fn recover_in_flight(&self) -> SyncResult<u64> {
        let mut recovered = 0;
        for collection in Collection::DRAIN_ORDER {
            let reset = self.reset_in_flight(collection).await?;
            if reset > 0 {
                tracing::warn!(
                    collection = %collection,
                    count = reset,
                    "Recovered records left in flight by an interrupted delivery"
                );
            }
            recovered += reset;
        }
        Ok(recovered)
    }

    async fn used_bytes(conn: &mut SqliteConnection) -> SyncResult<u64> {
        let sum = Collection::DRAIN_ORDER
            .iter()
            .map(|c| format!("(SELECT COALESCE(SUM(size_bytes), 0) FROM {})", c.table()))
            .collect::<Vec<_>>()
            .join(" + ");

        let row = sqlx::query(&format!("SELECT {} AS total", sum))
            .fetch_one(&mut *conn)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(to_u64(total))
    }

    /// Append a record and return its newly assigned local id.
    ///
    /// When the storage budget would be exceeded, the oldest media snapshots
    /// are evicted in the same transaction. Answers, violations and video
    /// chunks are never evicted; if evicting snapshots is not enough the call
    /// fails with [`StorageFailure::QuotaExceeded`] and nothing is written.
    pub async fn append(&self, collection: Collection, record: NewRecord) -> SyncResult<AppendReceipt> {
        if record.collection() != collection {
            return Err(SyncError::InvalidOperation(format!(
                "Payload for {} cannot be appended to {}",
                record.collection(),
                collection
            )));
        }

        let payload = serde_json::to_string(&record.payload)?;
        let blob_len = record.blob.as_ref().map_or(0, Vec::len);
        let size_bytes = u64::try_from(payload.len() + blob_len).unwrap_or(u64::MAX);

        if size_bytes > self.max_storage_bytes {
            return Err(StorageFailure::QuotaExceeded {
                needed: size_bytes,
                limit: self.max_storage_bytes,
            }
            .into());
        }

        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let used = Self::used_bytes(&mut tx).await?;
        let mut evicted_media = Vec::new();

        if used + size_bytes > self.max_storage_bytes {
            let excess = used + size_bytes - self.max_storage_bytes;
            let candidates = sqlx::query(
                r#"
                SELECT local_id, size_bytes FROM media
                WHERE sync_state != 'in_flight'
                ORDER BY local_id ASC
                "#,
            )
            .fetch_all(&mut *tx)
            .await?;

            let mut freed = 0u64;
            for row in candidates {
                if freed >= excess {
                    break;
                }
                let local_id: i64 = row.try_get("local_id")?;
                let size: i64 = row.try_get("size_bytes")?;
                freed += to_u64(size);
                evicted_media.push(local_id);
            }

            if freed < excess {
                // Dropping the transaction rolls it back.
                return Err(StorageFailure::QuotaExceeded {
                    needed: size_bytes,
                    limit: self.max_storage_bytes,
                }
                .into());
            }

            for local_id in &evicted_media {
                sqlx::query("DELETE FROM media WHERE local_id = ?")
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                saved_at, payload, blob, group_key, seq,
                sync_state, attempts, size_bytes
            ) VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
            "#,
            collection.table()
        ))
        .bind(format_ts(&record.saved_at))
        .bind(&payload)
        .bind(record.blob.as_deref())
        .bind(record.payload.group_key())
        .bind(record.payload.sequence())
        .bind(to_i64(size_bytes))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let local_id = result.last_insert_rowid();

        if !evicted_media.is_empty() {
            tracing::warn!(
                count = evicted_media.len(),
                oldest = ?evicted_media.first(),
                budget = self.max_storage_bytes,
                "Evicted media snapshots to stay within the storage budget"
            );
        }

        tracing::debug!(
            collection = %collection,
            local_id,
            size_bytes,
            "Appended record"
        );

        Ok(AppendReceipt {
            local_id,
            evicted_media,
        })
    }

    fn decode_row(collection: Collection, row: &SqliteRow) -> SyncResult<Record> {
        let local_id: i64 = row.try_get("local_id")?;
        let saved_at: String = row.try_get("saved_at")?;
        let payload: String = row.try_get("payload")?;
        let blob: Option<Vec<u8>> = row.try_get("blob")?;
        let sync_state: String = row.try_get("sync_state")?;
        let attempts: i64 = row.try_get("attempts")?;
        let next_attempt_at: Option<String> = row.try_get("next_attempt_at")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let size_bytes: i64 = row.try_get("size_bytes")?;

        let payload: RecordPayload = serde_json::from_str(&payload)
            .map_err(|e| corrupt(collection, local_id, format!("Invalid payload: {}", e)))?;
        if payload.collection() != collection {
            return Err(corrupt(
                collection,
                local_id,
                format!("Payload belongs to {}", payload.collection()),
            ));
        }

        Ok(Record {
            local_id,
            collection,
            saved_at: parse_ts(collection, local_id, &saved_at)?,
            payload,
            blob,
            sync_state: sync_state
                .parse()
                .map_err(|e: SyncError| corrupt(collection, local_id, e.to_string()))?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            next_attempt_at: next_attempt_at
                .as_deref()
                .map(|raw| parse_ts(collection, local_id, raw))
                .transpose()?,
            last_error,
            size_bytes: to_u64(size_bytes),
        })
    }

    /// All records that are not dead-lettered, ascending by local id.
    pub async fn list_pending(&self, collection: Collection) -> SyncResult<Vec<Record>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM {}
            WHERE sync_state != 'dead_lettered'
            ORDER BY local_id ASC
            "#,
            collection.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::decode_row(collection, row))
            .collect()
    }

    /// Ids of records that are not dead-lettered, in delivery order.
    ///
    /// Ascending local id, except video chunks which are ordered by
    /// recording session and chunk index.
    pub async fn list_pending_ids(&self, collection: Collection) -> SyncResult<Vec<i64>> {
        let order = match collection {
            Collection::VideoChunks => "group_key ASC, seq ASC, local_id ASC",
            _ => "local_id ASC",
        };

        let rows = sqlx::query(&format!(
            "SELECT local_id FROM {} WHERE sync_state != 'dead_lettered' ORDER BY {}",
            collection.table(),
            order
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("local_id").map_err(SyncError::from))
            .collect()
    }

    /// Dead-lettered records, ascending by local id.
    pub async fn list_dead_lettered(&self, collection: Collection) -> SyncResult<Vec<Record>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM {}
            WHERE sync_state = 'dead_lettered'
            ORDER BY local_id ASC
            "#,
            collection.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::decode_row(collection, row))
            .collect()
    }

    /// Fetch one record regardless of state.
    pub async fn get(&self, collection: Collection, local_id: i64) -> SyncResult<Option<Record>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE local_id = ?",
            collection.table()
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| Self::decode_row(collection, row))
            .transpose()
    }

    /// Delete exactly one record. Removing a missing id is a no-op.
    pub async fn remove(&self, collection: Collection, local_id: i64) -> SyncResult<bool> {
        let _write = self.write_lock.lock().await;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE local_id = ?", collection.table()))
            .bind(local_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a delivered video chunk and advance its recording's progress
    /// in one transaction.
    pub async fn remove_delivered_chunk(
        &self,
        local_id: i64,
        recording_session_id: Uuid,
        chunk_index: u64,
    ) -> SyncResult<bool> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM video_chunks WHERE local_id = ?")
            .bind(local_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_progress (recording_session_id, last_index, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(recording_session_id) DO UPDATE SET
                last_index = MAX(last_index, excluded.last_index),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(recording_session_id.to_string())
        .bind(to_i64(chunk_index))
        .bind(format_ts(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Highest chunk index delivered for a recording, if any.
    pub async fn last_delivered_chunk(&self, recording_session_id: Uuid) -> SyncResult<Option<u64>> {
        let row = sqlx::query("SELECT last_index FROM chunk_progress WHERE recording_session_id = ?")
            .bind(recording_session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.try_get::<i64, _>("last_index").map(to_u64))
            .transpose()
            .map_err(SyncError::from)
    }

    /// Bulk delete. Only for explicit resets, never for normal draining.
    ///
    /// Clearing video chunks also forgets per-recording delivery progress.
    pub async fn clear(&self, collection: Collection) -> SyncResult<u64> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!("DELETE FROM {}", collection.table()))
            .execute(&mut *tx)
            .await?;
        if collection == Collection::VideoChunks {
            sqlx::query("DELETE FROM chunk_progress").execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::info!(
            collection = %collection,
            removed = result.rows_affected(),
            "Cleared collection"
        );

        Ok(result.rows_affected())
    }

    /// Mark a pending record in flight and count the attempt.
    ///
    /// Returns the new attempt count.
    pub async fn mark_in_flight(&self, collection: Collection, local_id: i64) -> SyncResult<u32> {
        let _write = self.write_lock.lock().await;
        let row = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sync_state = 'in_flight',
                attempts = attempts + 1
            WHERE local_id = ? AND sync_state = 'pending'
            RETURNING attempts
            "#,
            collection.table()
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let attempts: i64 = row.try_get("attempts")?;
                Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
            }
            None => Err(SyncError::InvalidOperation(format!(
                "Record {}/{} is not pending",
                collection, local_id
            ))),
        }
    }

    /// Revert a failed delivery to pending and schedule the next attempt.
    pub async fn mark_failed(
        &self,
        collection: Collection,
        local_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sync_state = 'pending',
                last_error = ?,
                next_attempt_at = ?
            WHERE local_id = ?
            "#,
            collection.table()
        ))
        .bind(error)
        .bind(format_ts(&next_attempt_at))
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            collection = %collection,
            local_id,
            error,
            next_attempt_at = %next_attempt_at,
            "Record delivery failed"
        );

        Ok(())
    }

    /// Return an in-flight record to pending without charging the attempt.
    ///
    /// Used by the final flush so its rapid retries never push a record to
    /// the dead-letter cap. The backoff schedule is left untouched.
    pub async fn release_attempt(&self, collection: Collection, local_id: i64, error: &str) -> SyncResult<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sync_state = 'pending',
                attempts = MAX(attempts - 1, 0),
                last_error = ?
            WHERE local_id = ? AND sync_state = 'in_flight'
            "#,
            collection.table()
        ))
        .bind(error)
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            collection = %collection,
            local_id,
            error,
            "Flush submission failed, record stays queued"
        );

        Ok(())
    }

    /// Exclude a record from automatic retry. The record is kept.
    pub async fn mark_dead_lettered(
        &self,
        collection: Collection,
        local_id: i64,
        error: &str,
    ) -> SyncResult<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sync_state = 'dead_lettered',
                last_error = ?,
                next_attempt_at = NULL
            WHERE local_id = ?
            "#,
            collection.table()
        ))
        .bind(error)
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            collection = %collection,
            local_id,
            error,
            "Record marked dead-lettered"
        );

        Ok(())
    }

    /// Move dead-lettered records back to pending with a fresh attempt budget.
    pub async fn requeue_dead_lettered(&self, collection: Collection) -> SyncResult<u64> {
        let _write = self.write_lock.lock().await;
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET sync_state = 'pending',
                attempts = 0,
                next_attempt_at = NULL
            WHERE sync_state = 'dead_lettered'
            "#,
            collection.table()
        ))
        .execute(&self.pool)
        .await?;

        tracing::info!(
            collection = %collection,
            requeued = result.rows_affected(),
            "Requeued dead-lettered records"
        );

        Ok(result.rows_affected())
    }

    /// Return in-flight records to pending (abandoned or crashed deliveries).
    pub async fn reset_in_flight(&self, collection: Collection) -> SyncResult<u64> {
        let _write = self.write_lock.lock().await;
        let result = sqlx::query(&format!(
            "UPDATE {} SET sync_state = 'pending' WHERE sync_state = 'in_flight'",
            collection.table()
        ))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Bytes currently charged against the storage budget.
    pub async fn total_bytes(&self) -> SyncResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::used_bytes(&mut conn).await
    }

    /// Number of records still stored in any state across all collections.
    pub async fn count_remaining(&self) -> SyncResult<u64> {
        let sum = Collection::DRAIN_ORDER
            .iter()
            .map(|c| format!("(SELECT COUNT(*) FROM {})", c.table()))
            .collect::<Vec<_>>()
            .join(" + ");

        let row = sqlx::query(&format!("SELECT {} AS remaining", sum))
            .fetch_one(&self.pool)
            .await?;
        let remaining: i64 = row.try_get("remaining")?;
        Ok(to_u64(remaining))
    }

    /// Per-collection counters for diagnostics.
    pub async fn stats(&self) -> SyncResult<StoreStats> {
        let mut stats = StoreStats::default();

        for collection in Collection::DRAIN_ORDER {
            let rows = sqlx::query(&format!(
                r#"
                SELECT sync_state,
                       COUNT(*) AS count,
                       COALESCE(SUM(size_bytes), 0) AS bytes,
                       MIN(saved_at) AS oldest
                FROM {}
                GROUP BY sync_state
                "#,
                collection.table()
            ))
            .fetch_all(&self.pool)
            .await?;

            let mut entry = CollectionStats::default();
            for row in rows {
                let state: String = row.try_get("sync_state")?;
                let count = to_u64(row.try_get("count")?);
                let bytes = to_u64(row.try_get("bytes")?);
                let oldest: Option<String> = row.try_get("oldest")?;

                match state.parse::<SyncState>()? {
                    SyncState::Pending => entry.pending += count,
                    SyncState::InFlight => entry.in_flight += count,
                    SyncState::DeadLettered => entry.dead_lettered += count,
                    SyncState::Delivered => {}
                }
                entry.bytes += bytes;

                if let Some(raw) = oldest {
                    let ts = parse_ts(collection, 0, &raw)?;
                    entry.oldest_saved_at = Some(match entry.oldest_saved_at {
                        Some(current) if current <= ts => current,
                        _ => ts,
                    });
                }
            }

            stats.collections.insert(collection, entry);
        }

        Ok(stats)
    }

    /// Count records older than the configured maximum age and warn about them.
    ///
    /// Stale records are never deleted; this only makes them visible.
    pub async fn check_retention(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let max_age = chrono::Duration::from_std(self.max_record_age)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = format_ts(&(now - max_age));
        let mut stale_total = 0;

        for collection in Collection::DRAIN_ORDER {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS stale FROM {} WHERE saved_at < ?",
                collection.table()
            ))
            .bind(&cutoff)
            .fetch_one(&self.pool)
            .await?;
            let stale = to_u64(row.try_get("stale")?);

            if stale > 0 {
                tracing::warn!(
                    collection = %collection,
                    stale,
                    max_age_secs = self.max_record_age.as_secs(),
                    "Stale records are still waiting for delivery"
                );
            }
            stale_total += stale;
        }

        Ok(stale_total)
    }

    /// Node id persisted with this store, prefix of every idempotency key
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Reclaim space after bulk deletions (post-exam cleanup).
    pub async fn vacuum(&self) -> SyncResult<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
    }
}
