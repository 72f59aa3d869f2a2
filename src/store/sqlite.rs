// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed object store.
//!
//! One row per `(namespace, key)` holding the latest version. Keys are
//! stored as BLOBs so `ORDER BY key` matches byte order. Version vectors
//! are bincode-encoded.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED under contention. Each
//! statement is retried with exponential backoff. Read-modify-write
//! operations (put, delete, update) are serialized behind a write lock
//! so two gossip sessions applying the same key cannot interleave.

use super::{CorruptObject, Count, ObjectStore, ScanItem, ScanRange, StoreFuture};
use crate::error::{ReplicaError, Result};
use crate::object::{Identity, Object, UpdateType, VersionVector};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Attempts per statement before a busy database is reported as a storage error.
const BUSY_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF_START: Duration = Duration::from_millis(10);
const BUSY_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6): another session holds the write lock.
fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    match db.code() {
        Some(code) => matches!(&*code, "5" | "6"),
        None => {
            let msg = db.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run `statement`, backing off while the database is busy.
///
/// Concurrent gossip sessions applying repairs are the usual source of
/// contention; every retry is counted under `operation`.
async fn with_busy_retry<F, Fut, T>(operation: &str, mut statement: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut backoff = BUSY_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match statement().await {
            Err(e) if attempt < BUSY_ATTEMPTS && is_busy(&e) => {
                debug!(operation, attempt, ?backoff, "Object store busy");
                crate::metrics::record_store_retry(operation);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BUSY_BACKOFF_CAP);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// (key, value, version, tombstone, owner, region, modified)
type ObjectRow = (Vec<u8>, Vec<u8>, Vec<u8>, bool, String, String, i64);

fn from_row(namespace: &str, row: ObjectRow) -> Result<Object> {
    let (key, value, version, tombstone, owner, region, modified) = row;
    let version: VersionVector = bincode::deserialize(&version)?;
    Ok(Object {
        namespace: namespace.to_string(),
        key,
        value,
        version,
        tombstone,
        owner,
        region,
        modified: DateTime::<Utc>::from_timestamp_millis(modified).unwrap_or_default(),
    })
}

/// Decode one scanned row; a bad version blob is reported against its key.
fn decode_row(namespace: &str, row: ObjectRow) -> ScanItem {
    let key = row.0.clone();
    from_row(namespace, row).map_err(|e| {
        warn!(namespace, error = %e, "Could not decode stored object");
        CorruptObject {
            namespace: namespace.to_string(),
            key,
            reason: e.to_string(),
        }
    })
}

/// Persistent object store backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    identity: Identity,
    write_lock: Mutex<()>,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>, identity: Identity) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening object store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicaError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                namespace TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                version BLOB NOT NULL,
                tombstone INTEGER NOT NULL,
                owner TEXT NOT NULL,
                region TEXT NOT NULL,
                modified INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            identity,
            write_lock: Mutex::new(()),
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn fetch(&self, namespace: &str, key: &[u8]) -> Result<Option<Object>> {
        let pool = &self.pool;
        let row: Option<ObjectRow> = with_busy_retry("object", || async {
            sqlx::query_as(
                "SELECT key, value, version, tombstone, owner, region, modified \
                 FROM objects WHERE namespace = ? AND key = ?",
            )
            .bind(namespace)
            .bind(key)
            .fetch_optional(pool)
            .await
        })
        .await?;

        row.map(|r| from_row(namespace, r)).transpose()
    }

    async fn store(&self, obj: &Object) -> Result<()> {
        let version = bincode::serialize(&obj.version)?;
        let modified = obj.modified.timestamp_millis();
        let pool = &self.pool;

        with_busy_retry("store", || async {
            sqlx::query(
                r#"
                INSERT INTO objects (namespace, key, value, version, tombstone, owner, region, modified)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, key) DO UPDATE SET
                    value = excluded.value,
                    version = excluded.version,
                    tombstone = excluded.tombstone,
                    owner = excluded.owner,
                    region = excluded.region,
                    modified = excluded.modified
                "#,
            )
            .bind(&obj.namespace)
            .bind(&obj.key)
            .bind(&obj.value)
            .bind(&version)
            .bind(obj.tombstone)
            .bind(&obj.owner)
            .bind(&obj.region)
            .bind(modified)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Object store closed");
    }
}

impl ObjectStore for SqliteStore {
    fn get<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            match self.fetch(namespace, key).await? {
                Some(obj) if !obj.tombstone => Ok(obj.value),
                _ => Err(ReplicaError::NotFound(namespace.to_string())),
            }
        })
    }

    fn put<'a>(&'a self, namespace: &'a str, key: &'a [u8], value: Vec<u8>) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let prev = self.fetch(namespace, key).await?;
            let obj = self.identity.stamp(namespace, key, value, prev.as_ref(), false);
            self.store(&obj).await?;
            Ok(obj)
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let prev = match self.fetch(namespace, key).await? {
                Some(prev) if !prev.tombstone => prev,
                _ => return Err(ReplicaError::NotFound(namespace.to_string())),
            };
            let obj = self.identity.stamp(namespace, key, Vec::new(), Some(&prev), true);
            self.store(&obj).await?;
            Ok(obj)
        })
    }

    fn object<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            self.fetch(namespace, key)
                .await?
                .ok_or_else(|| ReplicaError::NotFound(namespace.to_string()))
        })
    }

    fn update(&self, object: Object) -> StoreFuture<'_, UpdateType> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let local = self.fetch(&object.namespace, &object.key).await?;
            let update = UpdateType::resolve(local.as_ref().map(|o| &o.version), &object.version);
            if update.applied() {
                self.store(&object).await?;
            }
            Ok(update)
        })
    }

    fn scan<'a>(&'a self, namespace: &'a str, range: ScanRange) -> StoreFuture<'a, Vec<ScanItem>> {
        Box::pin(async move {
            let lower = match &range.start {
                Some(start) if start.as_slice() > range.prefix.as_slice() => start.clone(),
                _ => range.prefix.clone(),
            };
            let limit: i64 = if range.limit == 0 { -1 } else { range.limit as i64 };
            let tombstones = range.tombstones;
            let pool = &self.pool;

            let mut sql = String::from(
                "SELECT key, value, version, tombstone, owner, region, modified \
                 FROM objects WHERE namespace = ? AND key >= ? AND (? OR tombstone = 0)",
            );
            if !range.prefix.is_empty() {
                sql.push_str(" AND substr(key, 1, ?) = ?");
            }
            sql.push_str(" ORDER BY key LIMIT ?");

            let rows: Vec<ObjectRow> = with_busy_retry("scan", || {
                let mut query = sqlx::query_as(&sql)
                    .bind(namespace)
                    .bind(&lower)
                    .bind(tombstones);
                if !range.prefix.is_empty() {
                    query = query.bind(range.prefix.len() as i64).bind(&range.prefix);
                }
                query.bind(limit).fetch_all(pool)
            })
            .await?;

            Ok(rows.into_iter().map(|row| decode_row(namespace, row)).collect())
        })
    }

    fn count<'a>(&'a self, namespace: &'a str, prefix: &'a [u8]) -> StoreFuture<'a, Count> {
        Box::pin(async move {
            let pool = &self.pool;
            let mut sql = String::from(
                "SELECT COUNT(*), COALESCE(SUM(length(key)), 0), COALESCE(SUM(length(value)), 0) \
                 FROM objects WHERE namespace = ? AND tombstone = 0",
            );
            if !prefix.is_empty() {
                sql.push_str(" AND substr(key, 1, ?) = ?");
            }

            let (objects, key_bytes, value_bytes): (i64, i64, i64) = with_busy_retry("count", || {
                let mut query = sqlx::query_as(&sql).bind(namespace);
                if !prefix.is_empty() {
                    query = query.bind(prefix.len() as i64).bind(prefix);
                }
                query.fetch_one(pool)
            })
            .await?;

            Ok(Count {
                objects: objects as u64,
                key_bytes: key_bytes as u64,
                value_bytes: value_bytes as u64,
            })
        })
    }
}
