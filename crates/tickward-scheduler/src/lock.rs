use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::LockError, store::LeaseStore};

pub const LOCK_KEY_PREFIX: &str = "scheduler:lock:";

/// Store key guarding the ticks of `task`.
pub fn lock_key(task: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{task}")
}

/// Mutual exclusion over a [`LeaseStore`]: acquire only if the key is free,
/// expire after a lease duration, release only by the owner.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
}

impl LeaseLock {
    pub fn new(store: impl LeaseStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Try to take `key` for `ttl`.
    ///
    /// `Ok(None)` means another holder owns the key, which is the normal
    /// outcome for all but one instance of a fleet. Store errors propagate so
    /// the caller can fail closed.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LockError> {
        // Fresh token per attempt: a stale holder can never match a newer lease.
        let token = Uuid::new_v4().to_string();
        if !self.store.set_if_absent(key, &token, ttl).await? {
            return Ok(None);
        }
        debug!(key, "lease acquired");
        Ok(Some(LeaseGuard {
            lock: self.clone(),
            key: key.to_string(),
            token,
            ttl,
            acquired_at: Instant::now(),
            released: false,
        }))
    }

    /// Delete `key` if it is still owned by `token`.
    pub async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        if self.store.compare_and_delete(key, token).await? {
            debug!(key, "lease released");
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: key.to_string(),
            })
        }
    }
}

/// Proof of lease ownership.
///
/// Call [`LeaseGuard::release`] on every path. A guard dropped without
/// release schedules a best-effort release on the current runtime; the TTL
/// covers the case where even that cannot run.
pub struct LeaseGuard {
    lock: LeaseLock,
    key: String,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fencing token stored as the lease value.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time since acquisition. Past `ttl` the lease may belong to someone else.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release(&self.key, &self.token).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lease guard dropped outside a runtime; waiting for TTL expiry");
            return;
        };
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = lock.release(&key, &token).await {
                warn!(key = %key, error = %e, "release of dropped lease failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn key_uses_scheduler_prefix() {
        assert_eq!(lock_key("ping"), "scheduler:lock:ping");
    }

    #[tokio::test]
    async fn concurrent_acquire_has_a_single_winner() {
        let store = MemoryStore::new();
        let a = LeaseLock::new(store.clone());
        let b = LeaseLock::new(store.clone());

        let (ra, rb) = tokio::join!(a.try_acquire("k", TTL), b.try_acquire("k", TTL));
        let winners = [ra.unwrap(), rb.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquisition() {
        let lock = LeaseLock::new(MemoryStore::new());
        let first = lock.try_acquire("k", TTL).await.unwrap().unwrap();
        let first_token = first.token().to_string();
        first.release().await.unwrap();

        let second = lock.try_acquire("k", TTL).await.unwrap().unwrap();
        assert_ne!(first_token, second.token());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_token_never_deletes_the_lease() {
        let store = MemoryStore::new();
        let holder = LeaseLock::new(store.clone());
        let intruder = LeaseLock::new(store.clone());
        let observer = LeaseLock::new(store.clone());

        let guard = holder.try_acquire("k", TTL).await.unwrap().unwrap();

        let err = intruder.release("k", "not-the-token").await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
        assert!(observer.try_acquire("k", TTL).await.unwrap().is_none());
        assert_eq!(store.owner("k").as_deref(), Some(guard.token()));

        guard.release().await.unwrap();
        assert!(observer.try_acquire("k", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_release_the_next_lease() {
        let store = MemoryStore::new();
        let lock = LeaseLock::new(store.clone());

        let stale = lock.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(stale.held_for() > stale.ttl());

        let fresh = lock.try_acquire("k", TTL).await.unwrap().unwrap();
        assert!(matches!(stale.release().await, Err(LockError::NotHeld { .. })));
        assert_eq!(store.owner("k").as_deref(), Some(fresh.token()));
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let store = MemoryStore::new();
        let lock = LeaseLock::new(store.clone());

        drop(lock.try_acquire("k", TTL).await.unwrap().unwrap());
        for _ in 0..10 {
            if store.owner("k").is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.owner("k"), None);
    }
}
