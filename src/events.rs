//! Upload lifecycle notifications.
//!
//! Handlers publish onto a shared broadcast channel at the same points the
//! `on_upload_create` / `on_upload_finish` hooks fire. Unlike those hooks,
//! which run synchronously inline with the request and can reject it,
//! subscribers here are purely observational — a slow or absent subscriber
//! never affects the response.

use tokio::sync::broadcast;

use crate::stores::UploadInfo;

#[derive(Debug, Clone)]
pub enum TusEvent {
    Created(UploadInfo),
    Progress { id: String, offset: u64, size: Option<u64> },
    Completed(UploadInfo),
    Terminated { id: String },
}

/// Thin wrapper around a [`broadcast::Sender`] so callers don't need to
/// depend on `tokio::sync::broadcast` directly to subscribe.
#[derive(Clone)]
pub struct TusEventBus {
    tx: broadcast::Sender<TusEvent>,
}

impl TusEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TusEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish. Returns quietly if there are no subscribers.
    pub fn publish(&self, event: TusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for TusEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
