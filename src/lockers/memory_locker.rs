use std::collections::HashMap;
use std::sync::Arc;

use salvo_core::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::TusResult;
use crate::lockers::{EvictionCallback, Locker, UploadLock};

struct LockState {
    /// `Some` while held; carries the holder's eviction callback so a new
    /// acquirer can signal it without blocking.
    holder: Mutex<Option<EvictionCallback>>,
    notify: Notify,
}

impl LockState {
    fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

pub struct MemoryUploadLock {
    state: Arc<LockState>,
}

#[async_trait]
impl UploadLock for MemoryUploadLock {
    async fn lock(&self, on_evicted: EvictionCallback) -> TusResult<()> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut holder = self.state.holder.lock().await;
            match holder.take() {
                None => {
                    *holder = Some(on_evicted);
                    return Ok(());
                }
                Some(current) => {
                    // Put the current holder back; we're not taking over yet.
                    current();
                    *holder = Some(current);
                    drop(holder);
                    notified.await;
                }
            }
        }
    }

    async fn unlock(&self) {
        let mut holder = self.state.holder.lock().await;
        *holder = None;
        drop(holder);
        self.state.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct MemoryLocker {
    inner: Arc<Mutex<HashMap<String, Arc<LockState>>>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn new_lock(&self, id: &str) -> Arc<dyn UploadLock> {
        let mut map = self.inner.lock().await;
        let state = map
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(LockState::new()))
            .clone();
        Arc::new(MemoryUploadLock { state })
    }
}
