//! Request context: the cancel-with-cause handle every verb handler carries
//! for the lifetime of one request, plus the delayed variant passed to the
//! store so a backend can finish a durable write after the client has gone.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::{CancellationContext, CancellationReason};

/// Carried alongside a request. `cancellable` is cancelled the moment the
/// handler decides the request must stop (shutdown, lock eviction, a
/// stop-upload hook). `delayed` mirrors it but only fires
/// `graceful_completion` after `cancellable` does, giving the store a grace
/// window to finish the write it's mid-way through.
#[derive(Clone)]
pub struct RequestContext {
    pub cause: CancellationContext,
    cancellable: CancellationToken,
    delayed: CancellationToken,
    pub span: Span,
}

impl RequestContext {
    pub fn new(span: Span, graceful_completion: Duration) -> Self {
        let cause = CancellationContext::new();
        let cancellable = CancellationToken::new();
        let delayed = cancellable.child_token();

        let watcher_cancellable = cancellable.clone();
        let watcher_delayed = delayed.clone();
        let mut signal = cause.signal.clone();
        tokio::spawn(async move {
            signal.cancelled().await;
            watcher_cancellable.cancel();
            tokio::time::sleep(graceful_completion).await;
            watcher_delayed.cancel();
        });

        Self {
            cause,
            cancellable,
            delayed,
            span,
        }
    }

    pub fn cancellable_token(&self) -> CancellationToken {
        self.cancellable.clone()
    }

    pub fn delayed_token(&self) -> CancellationToken {
        self.delayed.clone()
    }

    pub fn cancel(&self, reason: CancellationReason) {
        match reason {
            CancellationReason::Abort => self.cause.abort(),
            CancellationReason::Cancel => self.cause.cancel(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellable.is_cancelled()
    }
}
