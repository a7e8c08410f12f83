//! Lease backend selected from `[store]`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tickward_core::config::{StoreConfig, StoreKind};
use tickward_scheduler::{LeaseStore, MemoryStore, SqliteStore, StoreError};
use tracing::info;

/// The lease store this instance coordinates through. Built-in tasks keep a
/// handle to it for housekeeping and probes.
#[derive(Clone)]
pub enum StoreHandle {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreHandle {
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        match config.kind {
            StoreKind::Memory => {
                info!("lease store: in-memory (single instance)");
                Ok(Self::Memory(MemoryStore::new()))
            }
            StoreKind::Sqlite => {
                ensure_parent_dir(&config.path);
                info!(path = %config.path, "lease store: SQLite");
                let store = SqliteStore::open(&config.path, Duration::from_millis(config.busy_timeout_ms))?;
                Ok(Self::Sqlite(store))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }

    pub fn lease_store(&self) -> Arc<dyn LeaseStore> {
        match self {
            Self::Memory(store) => Arc::new(store.clone()),
            Self::Sqlite(store) => Arc::new(store.clone()),
        }
    }

    /// Drop expired leases. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.purge_expired()),
            Self::Sqlite(store) => store.purge_expired().await,
        }
    }
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_is_created_under_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/leases.db");
        let config = StoreConfig {
            kind: StoreKind::Sqlite,
            path: path.to_string_lossy().into_owned(),
            busy_timeout_ms: 1_000,
        };

        let store = StoreHandle::open(&config).unwrap();
        assert_eq!(store.kind(), "sqlite");
        assert!(path.exists());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
