//! Lock capability set.
//!
//! An upload is locked for the duration of a single request that mutates it
//! (`POST`, `PATCH`, `DELETE`). Unlike a plain mutex, acquiring the lock for
//! an id that is already held does not simply block: the new acquirer
//! signals the current holder's `on_evicted` callback so it can stop its
//! write and release promptly, then waits its turn. This mirrors how a
//! tus client reconnecting mid-upload is expected to interrupt a stale
//! connection rather than queue behind it.

pub mod memory_locker;

pub use memory_locker::MemoryLocker;

use std::sync::Arc;

use salvo_core::async_trait;

use crate::error::TusResult;

/// Called on the current lock holder when another request wants the same
/// upload id. Must not block; holders are expected to watch a cancellation
/// signal rather than invoke anything expensive here.
pub type EvictionCallback = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait Locker: Send + Sync + 'static {
    /// Returns a handle to the lock for `id`, creating its bookkeeping entry
    /// if this is the first time it's been seen. The handle is not held
    /// until [`UploadLock::lock`] succeeds.
    async fn new_lock(&self, id: &str) -> Arc<dyn UploadLock>;
}

#[async_trait]
pub trait UploadLock: Send + Sync {
    /// Acquires the lock, evicting the current holder (if any) by invoking
    /// `on_evicted`. Resolves once this caller holds the lock.
    async fn lock(&self, on_evicted: EvictionCallback) -> TusResult<()>;

    /// Releases the lock. Safe to call even if the lock isn't held.
    async fn unlock(&self);
}

/// RAII guard returned by [`crate::options::TusOptions::acquire_lock`] that
/// releases the upload lock on drop.
pub struct LockGuard {
    lock: Arc<dyn UploadLock>,
}

impl LockGuard {
    pub fn new(lock: Arc<dyn UploadLock>) -> Self {
        Self { lock }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        tokio::spawn(async move {
            lock.unlock().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_lock_guard_releases_on_drop() {
        let locker = MemoryLocker::new();
        let lock = locker.new_lock("abc").await;
        lock.lock(Arc::new(|| {})).await.unwrap();

        {
            let _guard = LockGuard::new(lock.clone());
        }
        // Give the spawned unlock task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let lock2 = locker.new_lock("abc").await;
        let evicted = Arc::new(AtomicUsize::new(0));
        let evicted2 = evicted.clone();
        lock2
            .lock(Arc::new(move || {
                evicted2.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
    }
}
