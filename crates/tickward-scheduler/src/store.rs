use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;

use crate::error::StoreError;

/// Key/value store shared by every scheduler instance of a fleet.
///
/// Both operations must be atomic on the backend: they are the only
/// synchronisation point between processes.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Store `value` under `key` with an expiry of `ttl`, only if no live
    /// value exists. Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if its live value equals `expected`. Returns whether
    /// a value was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected).await
    }
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process store. Clones share the same map, so several schedulers in one
/// process can contend on it as if they were separate instances.
///
/// Expiry uses tokio's clock and therefore honours paused time in tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live value of `key`, if any.
    pub fn owner(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = StoredValue {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at > now {
                    return Ok(false);
                }
                e.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, e| e.value == expected && e.expires_at > now)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn set_if_absent_refuses_a_live_key() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!store.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(store.owner("k").as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", TTL).await.unwrap());

        tokio::time::advance(TTL).await;
        assert_eq!(store.owner("k"), None);
        assert!(store.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(store.owner("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_and_delete_checks_the_value() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "a", TTL).await.unwrap();

        assert!(!store.compare_and_delete("k", "b").await.unwrap());
        assert_eq!(store.owner("k").as_deref(), Some("a"));
        assert!(store.compare_and_delete("k", "a").await.unwrap());
        assert_eq!(store.owner("k"), None);
        assert!(!store.compare_and_delete("k", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_is_not_deleted_by_its_old_owner() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "a", TTL).await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(!store.compare_and_delete("k", "a").await.unwrap());
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        assert!(a.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!b.set_if_absent("k", "b", TTL).await.unwrap());
    }
}
