use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::{error::StoreError, store::LeaseStore};

/// Initialise the lease schema in `conn`.
///
/// Creates the `leases` table (idempotent) and an index on `expires_at` so
/// housekeeping sweeps stay cheap.
pub fn init_db(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leases (
            key         TEXT    NOT NULL PRIMARY KEY,
            owner       TEXT    NOT NULL,   -- fencing token of the holder
            expires_at  INTEGER NOT NULL    -- unix epoch millis
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_leases_expires_at ON leases (expires_at);
        ",
    )?;
    Ok(())
}

/// Lease store backed by a SQLite file.
///
/// Every scheduler process that opens the same file takes part in the same
/// fleet. Expiry is measured in wall-clock milliseconds since hosts sharing
/// the file cannot share a monotonic clock.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current live owner of `key`, if any.
    pub async fn owner(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT owner FROM leases WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// Delete rows whose lease has expired. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let removed = self
            .with_conn(|conn| {
                Ok(conn.execute("DELETE FROM leases WHERE expires_at <= ?1", [now_ms()])?)
            })
            .await?;
        debug!(removed, "expired leases purged");
        Ok(removed)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking store task failed: {e}")))?
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let now = now_ms();
            // IMMEDIATE takes the write lock up front so two processes cannot
            // both see the key as expired.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM leases WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO leases (key, owner, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, now.saturating_add(ttl_ms)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM leases WHERE key = ?1 AND owner = ?2 AND expires_at > ?3",
                params![key, expected, now_ms()],
            )?;
            Ok(deleted == 1)
        })
        .await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
