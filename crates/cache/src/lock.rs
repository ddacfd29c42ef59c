//! Cross-instance mutual exclusion per execution id, with lease renewal.
//!
//! A lock is a fast-store key `lock:execution:<id>` holding
//! `<instance_id>:<acquired_at_millis>`. The holder renews the key's expiry
//! every third of the lease for as long as the key still holds its token;
//! renewal stops on release or as soon as ownership is lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{CacheError, FastStore};

const LOCK_PREFIX: &str = "lock:execution:";

/// Mutual exclusion over one execution's persisted state.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// `false` means another instance holds the lock; back off.
    async fn acquire(&self, execution_id: Uuid, lease: Duration) -> Result<bool, CacheError>;
    /// `true` if this instance held the lock and it is now released.
    async fn release(&self, execution_id: Uuid) -> Result<bool, CacheError>;
    async fn is_locked(&self, execution_id: Uuid) -> Result<bool, CacheError>;
    async fn is_locked_by_me(&self, execution_id: Uuid) -> Result<bool, CacheError>;
}

struct Held {
    token: String,
    renewal: JoinHandle<()>,
}

/// [`LockProvider`] over any [`FastStore`].
pub struct DistributedLock {
    store: Arc<dyn FastStore>,
    instance_id: String,
    held: Mutex<HashMap<Uuid, Held>>,
}

fn lock_key(execution_id: Uuid) -> String {
    format!("{LOCK_PREFIX}{execution_id}")
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

impl DistributedLock {
    pub fn new(store: Arc<dyn FastStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// `true` while a renewal task is running for `execution_id`.
    pub fn is_renewing(&self, execution_id: Uuid) -> bool {
        self.held()
            .get(&execution_id)
            .is_some_and(|h| !h.renewal.is_finished())
    }

    fn held(&self) -> MutexGuard<'_, HashMap<Uuid, Held>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn held_token(&self, execution_id: Uuid) -> Option<String> {
        self.held().get(&execution_id).map(|h| h.token.clone())
    }

    fn spawn_renewal(&self, execution_id: Uuid, token: String, lease: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let key = lock_key(execution_id);
        let period = (lease / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.compare_and_expire(&key, &token, lease).await {
                    Ok(true) => trace!("renewed lock for execution {}", execution_id),
                    Ok(false) => {
                        debug!("lock for execution {} lost, stopping renewal", execution_id);
                        break;
                    }
                    Err(e) => warn!("failed to renew lock for execution {}: {}", execution_id, e),
                }
            }
        })
    }
}

#[async_trait]
impl LockProvider for DistributedLock {
    async fn acquire(&self, execution_id: Uuid, lease: Duration) -> Result<bool, CacheError> {
        let token = format!("{}:{}", self.instance_id, now_millis());
        if !self
            .store
            .set_if_absent(&lock_key(execution_id), &token, lease)
            .await?
        {
            debug!("lock for execution {} is held elsewhere", execution_id);
            return Ok(false);
        }

        let renewal = self.spawn_renewal(execution_id, token.clone(), lease);
        if let Some(stale) = self.held().insert(execution_id, Held { token, renewal }) {
            stale.renewal.abort();
        }
        debug!("acquired lock for execution {} ({:?} lease)", execution_id, lease);
        Ok(true)
    }

    async fn release(&self, execution_id: Uuid) -> Result<bool, CacheError> {
        let held = self.held().remove(&execution_id);
        let Some(held) = held else {
            return Ok(false);
        };
        held.renewal.abort();

        let released = self
            .store
            .compare_and_delete(&lock_key(execution_id), &held.token)
            .await?;
        if released {
            debug!("released lock for execution {}", execution_id);
        } else {
            warn!("lock for execution {} expired before release", execution_id);
        }
        Ok(released)
    }

    async fn is_locked(&self, execution_id: Uuid) -> Result<bool, CacheError> {
        self.store.exists(&lock_key(execution_id)).await
    }

    /// Compares the stored value with the exact token this lock acquired.
    async fn is_locked_by_me(&self, execution_id: Uuid) -> Result<bool, CacheError> {
        let Some(token) = self.held_token(execution_id) else {
            return Ok(false);
        };
        let current = self.store.get(&lock_key(execution_id)).await?;
        Ok(current.as_deref() == Some(token.as_str()))
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        for (_, held) in self.held().drain() {
            held.renewal.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn pair() -> (Arc<dyn FastStore>, DistributedLock, DistributedLock) {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let a = DistributedLock::new(Arc::clone(&store), "instance-a");
        let b = DistributedLock::new(Arc::clone(&store), "instance-b");
        (store, a, b)
    }

    #[tokio::test]
    async fn second_instance_cannot_acquire() {
        let (_, a, b) = pair();
        let id = Uuid::new_v4();

        assert!(a.acquire(id, Duration::from_secs(30)).await.unwrap());
        assert!(!b.acquire(id, Duration::from_secs(30)).await.unwrap());
        assert!(b.is_locked(id).await.unwrap());
        assert!(!b.is_locked_by_me(id).await.unwrap());
        assert!(a.is_locked_by_me(id).await.unwrap());
    }

    #[tokio::test]
    async fn only_the_owner_releases() {
        let (_, a, b) = pair();
        let id = Uuid::new_v4();
        a.acquire(id, Duration::from_secs(30)).await.unwrap();

        assert!(!b.release(id).await.unwrap());
        assert!(a.is_locked_by_me(id).await.unwrap());

        assert!(a.release(id).await.unwrap());
        assert!(!a.is_locked(id).await.unwrap());
        assert!(b.acquire(id, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_the_lock_past_its_lease() {
        let (_, a, b) = pair();
        let id = Uuid::new_v4();
        let lease = Duration::from_millis(300);
        a.acquire(id, lease).await.unwrap();

        tokio::time::sleep(lease * 10).await;

        assert!(a.is_locked_by_me(id).await.unwrap());
        assert!(!b.acquire(id, lease).await.unwrap());

        assert!(a.release(id).await.unwrap());
        assert!(!a.is_locked(id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lock_expires() {
        let (store, _, b) = pair();
        let id = Uuid::new_v4();
        let lease = Duration::from_millis(300);
        // Simulate a crashed holder: the key exists but nobody renews it.
        store
            .set_if_absent(&lock_key(id), "instance-a:0", lease)
            .await
            .unwrap();

        tokio::time::sleep(lease * 2).await;

        assert!(!b.is_locked(id).await.unwrap());
        assert!(b.acquire(id, lease).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_stops_once_ownership_is_lost() {
        let (store, a, b) = pair();
        let id = Uuid::new_v4();
        let lease = Duration::from_millis(300);
        a.acquire(id, lease).await.unwrap();
        assert!(a.is_renewing(id));

        store.delete(&lock_key(id)).await.unwrap();
        assert!(b.acquire(id, lease).await.unwrap());

        tokio::time::sleep(lease).await;

        assert!(!a.is_renewing(id));
        assert!(b.is_locked_by_me(id).await.unwrap());
        assert!(!a.release(id).await.unwrap());
        assert!(b.is_locked_by_me(id).await.unwrap());
    }

    #[tokio::test]
    async fn locks_sharing_an_instance_id_stay_distinct() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let a = DistributedLock::new(Arc::clone(&store), "shared");
        let b = DistributedLock::new(Arc::clone(&store), "shared");
        let id = Uuid::new_v4();

        assert!(a.acquire(id, Duration::from_secs(30)).await.unwrap());
        assert!(!b.is_locked_by_me(id).await.unwrap());
        assert!(!b.release(id).await.unwrap());
        assert!(a.is_locked_by_me(id).await.unwrap());

        // Same instance prefix, different token.
        store
            .set(&lock_key(id), "shared:0", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!a.is_locked_by_me(id).await.unwrap());
        assert!(!a.release(id).await.unwrap());
        assert!(a.is_locked(id).await.unwrap());
    }
}
