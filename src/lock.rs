//! Scheduler lease management.
//!
//! At most one scheduler instance per lease key may promote jobs. The lease is
//! a store key holding a random owner token with an expiry:
//!
//! - acquire: `SET key token NX PX ttl`
//! - renew: extend the expiry only while the key still holds our token
//! - release: delete the key only while it still holds our token
//!
//! A crashed holder simply stops renewing; its lease expires and any other
//! instance can take over on its next poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LockError, StoreError};
use crate::store::Store;

/// Proof of holding a scheduler lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    owner_token: String,
    acquired_at: Instant,
    expires_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Local estimate of when the store will drop the lease.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Acquires, renews and releases scheduler leases.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns a lease if `key` was free, `None` if another instance holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StoreError>;

    /// Extends the lease. `false` means ownership was lost and the caller must
    /// stop acting as the active scheduler immediately.
    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool, StoreError>;

    /// Gives the lease up. A no-op returning `false` if it was already lost.
    async fn release(&self, lease: &Lease) -> Result<bool, StoreError>;

    /// Like [`acquire`](Self::acquire) but reports contention as an error.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        self.acquire(key, ttl)
            .await?
            .ok_or_else(|| LockError::Unavailable {
                key: key.to_string(),
            })
    }

    /// Like [`renew`](Self::renew) but reports lost ownership as an error.
    async fn ensure_renewed(&self, lease: &mut Lease, ttl: Duration) -> Result<(), LockError> {
        if self.renew(lease, ttl).await? {
            Ok(())
        } else {
            Err(LockError::OwnershipLost {
                key: lease.key().to_string(),
            })
        }
    }
}

/// Lease manager built on the store's conditional primitives.
#[derive(Clone)]
pub struct StoreLockManager {
    store: Arc<dyn Store>,
}

impl StoreLockManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn new_token() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[async_trait]
impl LockManager for StoreLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let token = Self::new_token();
        let now = Instant::now();

        if !self.store.set_if_absent(key, &token, ttl).await? {
            debug!(lock_key = %key, "Lease held by another instance");
            return Ok(None);
        }

        debug!(lock_key = %key, owner_token = %token, "Lease acquired");
        Ok(Some(Lease {
            key: key.to_string(),
            owner_token: token,
            acquired_at: now,
            expires_at: now + ttl,
        }))
    }

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let renewed = self
            .store
            .expire_if_equals(&lease.key, &lease.owner_token, ttl)
            .await?;
        if renewed {
            lease.expires_at = now + ttl;
        }
        Ok(renewed)
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StoreError> {
        let released = self
            .store
            .delete_if_equals(&lease.key, &lease.owner_token)
            .await?;
        if !released {
            debug!(lock_key = %lease.key, "Lease already lost before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const KEY: &str = "rq:scheduler:scheduler_lock";

    fn manager() -> (Arc<MemoryStore>, StoreLockManager) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), StoreLockManager::new(store))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let (_, locks) = manager();

        let lease = locks
            .acquire(KEY, Duration::from_secs(10))
            .await
            .expect("store ok");
        assert!(lease.is_some());

        let second = locks
            .acquire(KEY, Duration::from_secs(10))
            .await
            .expect("store ok");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let (_, locks) = manager();
        assert!(locks
            .acquire("group-a:lock", Duration::from_secs(10))
            .await
            .expect("store ok")
            .is_some());
        assert!(locks
            .acquire("group-b:lock", Duration::from_secs(10))
            .await
            .expect("store ok")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let (_, locks) = manager();
        let mut lease = locks
            .try_acquire(KEY, Duration::from_secs(10))
            .await
            .expect("free");

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(locks
            .renew(&mut lease, Duration::from_secs(10))
            .await
            .expect("store ok"));

        // Past the original expiry but within the renewed one.
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!lease.is_expired());
        assert!(locks
            .acquire(KEY, Duration::from_secs(10))
            .await
            .expect("store ok")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_takeover_fails() {
        let (_, locks) = manager();
        let mut stale = locks
            .try_acquire(KEY, Duration::from_secs(5))
            .await
            .expect("free");

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = locks
            .try_acquire(KEY, Duration::from_secs(5))
            .await
            .expect("expired lease is free again");
        assert_ne!(fresh.owner_token(), stale.owner_token());

        assert!(!locks
            .renew(&mut stale, Duration::from_secs(5))
            .await
            .expect("store ok"));
        let err = locks
            .ensure_renewed(&mut stale, Duration::from_secs(5))
            .await
            .expect_err("ownership lost");
        assert!(matches!(err, LockError::OwnershipLost { .. }));
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let (store, locks) = manager();
        let lease = locks
            .try_acquire(KEY, Duration::from_secs(30))
            .await
            .expect("free");

        let mut impostor = lease.clone();
        impostor.owner_token = "someone-else".to_string();
        assert!(!locks.release(&impostor).await.expect("store ok"));
        assert!(store.get(KEY).await.expect("store ok").is_some());

        assert!(locks.release(&lease).await.expect("store ok"));
        assert!(!locks.release(&lease).await.expect("second release is a no-op"));
        assert!(locks
            .acquire(KEY, Duration::from_secs(30))
            .await
            .expect("store ok")
            .is_some());
    }

    #[tokio::test]
    async fn test_try_acquire_contention() {
        let (_, locks) = manager();
        let _held = locks
            .try_acquire(KEY, Duration::from_secs(30))
            .await
            .expect("free");

        let err = locks
            .try_acquire(KEY, Duration::from_secs(30))
            .await
            .expect_err("held");
        assert!(matches!(err, LockError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let (store, locks) = manager();
        store.set_offline(true);
        assert!(locks.acquire(KEY, Duration::from_secs(30)).await.is_err());
    }
}
