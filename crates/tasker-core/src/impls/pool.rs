//! ResourcePool - 同時利用数に上限のある Dependency
//!
//! Each lease holds one semaphore permit and one slot until it is released or
//! every clone of the handle is dropped. A request that cannot get a permit
//! within its timeout fails with `Timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::{LeaseHandle, TaskerError};
use crate::ports::Dependency;

#[derive(Debug)]
pub struct ResourcePool<T> {
    items: Vec<T>,
    free: Mutex<Vec<usize>>,
    permits: Arc<Semaphore>,
    default_timeout: Duration,
}

/// Returns the slot before the permit, so a new permit always finds a free slot.
struct SlotGuard<T> {
    pool: Arc<ResourcePool<T>>,
    slot: usize,
    _permit: OwnedSemaphorePermit,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.slot);
    }
}

/// Payload of a pool lease.
#[derive(Debug, Clone)]
pub struct Pooled<T> {
    pub slot: usize,
    pub item: T,
}

impl<T: Clone + Send + Sync + 'static> ResourcePool<T> {
    pub fn new(items: Vec<T>, default_timeout: Duration) -> Arc<Self> {
        let size = items.len();
        Arc::new(Self {
            items,
            free: Mutex::new((0..size).rev().collect()),
            permits: Arc::new(Semaphore::new(size)),
            default_timeout,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<LeaseHandle, TaskerError> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| TaskerError::Timeout { after: timeout })?
            .map_err(|_| TaskerError::Operation("resource pool closed".into()))?;

        let slot = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| TaskerError::Operation("resource pool slot accounting broke".into()))?;
        let guard = SlotGuard {
            pool: Arc::clone(self),
            slot,
            _permit: permit,
        };
        let payload = Pooled {
            slot,
            item: self.items[slot].clone(),
        };
        Ok(LeaseHandle::new(payload, move || async move {
            drop(guard);
        }))
    }
}

/// Wrapper so an `Arc<ResourcePool<T>>` can be registered as a dependency.
#[derive(Debug)]
pub struct PoolDependency<T>(pub Arc<ResourcePool<T>>);

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Dependency for PoolDependency<T> {
    fn default_timeout(&self) -> Duration {
        self.0.default_timeout
    }

    async fn request_resource(&self, timeout: Duration) -> Result<LeaseHandle, TaskerError> {
        self.0.acquire(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out_until_a_lease_is_released() {
        let pool = PoolDependency(ResourcePool::new(vec!["conn-a"], Duration::from_secs(1)));

        let first = pool.request_resource(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.payload::<Pooled<&str>>().unwrap().item, "conn-a");
        assert_eq!(pool.0.available(), 0);

        let err = pool
            .request_resource(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskerError::Timeout { .. }));

        first.release().await;
        let second = pool.request_resource(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.payload::<Pooled<&str>>().unwrap().slot, 0);
        second.release().await;
        assert_eq!(pool.0.available(), 1);
    }

    #[tokio::test]
    async fn dropping_an_unreleased_lease_frees_its_slot() {
        let pool = PoolDependency(ResourcePool::new(vec!["conn-a"], Duration::from_secs(1)));

        let first = pool.request_resource(Duration::from_secs(1)).await.unwrap();
        let clone = first.clone();
        drop(first);
        assert_eq!(pool.0.available(), 0, "a live clone keeps the slot");

        drop(clone);
        assert_eq!(pool.0.available(), 1);
        let second = pool.request_resource(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.payload::<Pooled<&str>>().unwrap().item, "conn-a");
        second.release().await;
        assert_eq!(pool.0.available(), 1);
    }
}
