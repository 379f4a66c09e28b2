//! Counting, ceiling-enforcing wrapper around an incoming request body.
//!
//! `PATCH` handlers stream request bytes straight into a [`crate::stores::DataStore`]
//! without buffering the whole upload in memory. This module sits between the
//! raw `salvo_core` body stream and the store: it tracks how many bytes have
//! passed through, refuses to yield more than the configured ceiling, and
//! remembers the first error so a read that kept going past a reset still
//! reports the original cause rather than whatever surfaced second.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep, sleep};

use crate::error::{ProtocolError, TusError, TusResult};

/// Sticky classification of the first error a [`CountingBodyReader`] hit.
/// Later polls keep surfacing this value rather than whatever the
/// underlying stream produces next.
#[derive(Debug, Clone)]
pub enum BodyReaderError {
    /// The client's declared `Content-Length` (or the chunked stream) ended
    /// before the store's expected offset was reached.
    UnexpectedEof,
    /// No bytes arrived within the read deadline.
    ReadTimeout,
    /// The connection was reset mid-body.
    ConnectionReset,
    /// More bytes arrived than the upload has room for.
    SizeExceeded,
    /// The reader was closed from outside because the server is shutting
    /// down.
    Closed,
    /// The reader was closed from outside because a competing request
    /// evicted this upload's lock.
    StoppedByServer,
}

impl From<BodyReaderError> for TusError {
    fn from(err: BodyReaderError) -> Self {
        match err {
            BodyReaderError::UnexpectedEof => TusError::UploadInterrupted,
            BodyReaderError::ReadTimeout => TusError::ReadTimeout,
            BodyReaderError::ConnectionReset => TusError::ConnectionReset,
            BodyReaderError::SizeExceeded => TusError::Protocol(ProtocolError::ErrMaxSizeExceeded),
            BodyReaderError::Closed => TusError::ServerShutdown,
            BodyReaderError::StoppedByServer => {
                TusError::UploadStopped("evicted by a competing request".into())
            }
        }
    }
}

/// Called after every successful read with the number of bytes just
/// produced. Handlers use this to push out a rolling read deadline and to
/// publish upload progress.
pub type OnReadDone = Arc<dyn Fn(u64) + Send + Sync>;

/// Wraps a `Stream<Item = Result<Bytes, E>>` with a byte counter, a byte
/// ceiling, and a sticky first-error slot.
///
/// Once `ceiling` bytes have been yielded, the next poll returns
/// `SizeExceeded` instead of further data, even if the underlying stream has
/// more to give: a client that keeps sending past the declared upload
/// length is a protocol violation, not something to silently truncate.
pub struct CountingBodyReader<S> {
    inner: S,
    counted: Arc<AtomicU64>,
    ceiling: u64,
    error_tx: watch::Sender<Option<BodyReaderError>>,
    error_rx: watch::Receiver<Option<BodyReaderError>>,
    on_read_done: Option<OnReadDone>,
    read_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

/// A detached handle that can abort a [`CountingBodyReader`]'s stream from
/// outside, after the reader itself has been moved into
/// [`into_byte_stream`].
#[derive(Clone)]
pub struct CloseHandle(watch::Sender<Option<BodyReaderError>>);

impl CloseHandle {
    pub fn close(&self, reason: BodyReaderError) {
        self.0.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl<S, E> CountingBodyReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: StdError + Send + Sync + 'static,
{
    pub fn new(inner: S, ceiling: u64) -> Self {
        let (error_tx, error_rx) = watch::channel(None);
        Self {
            inner,
            counted: Arc::new(AtomicU64::new(0)),
            ceiling,
            error_tx,
            error_rx,
            on_read_done: None,
            read_timeout: None,
            deadline: None,
        }
    }

    pub fn with_on_read_done(mut self, cb: OnReadDone) -> Self {
        self.on_read_done = Some(cb);
        self
    }

    /// Enables a rolling read deadline: if no chunk arrives within `timeout`,
    /// the next poll fails with `BodyReaderError::ReadTimeout`. The deadline
    /// resets after every chunk.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Box::pin(sleep(timeout)));
        self.read_timeout = Some(timeout);
        self
    }

    /// A handle that can abort this reader's stream from outside, usable
    /// after `self` has been moved into [`into_byte_stream`].
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.error_tx.clone())
    }

    /// Bytes yielded so far. Safe to read concurrently from another task
    /// (e.g. to drive a progress event) while the reader is being polled.
    pub fn bytes_read(&self) -> Arc<AtomicU64> {
        self.counted.clone()
    }

    /// First error observed, if any. Once set this never changes.
    pub fn first_error(&self) -> Option<BodyReaderError> {
        self.error_rx.borrow().clone()
    }

    /// A cheap clone of the sticky-error channel, usable after `self` has
    /// been moved into [`into_byte_stream`] to check what (if anything) went
    /// wrong once the stream is fully drained.
    pub fn error_handle(&self) -> watch::Receiver<Option<BodyReaderError>> {
        self.error_rx.clone()
    }

    /// Aborts the stream from outside: the next poll (and every poll after
    /// it) returns `reason` regardless of what the inner stream does.
    pub fn close_with_error(&self, reason: BodyReaderError) {
        self.error_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn record_error(&self, reason: BodyReaderError) -> BodyReaderError {
        self.error_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        });
        self.error_rx.borrow().clone().unwrap_or(reason)
    }
}

impl<S, E> Stream for CountingBodyReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: StdError + Send + Sync + 'static,
{
    type Item = Result<Bytes, BodyReaderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(sticky) = this.error_rx.borrow().clone() {
            return Poll::Ready(Some(Err(sticky)));
        }

        if this.counted.load(Ordering::Acquire) >= this.ceiling {
            let err = this.record_error(BodyReaderError::SizeExceeded);
            return Poll::Ready(Some(Err(err)));
        }

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            let err = this.record_error(BodyReaderError::ReadTimeout);
            return Poll::Ready(Some(Err(err)));
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Err(_))) => {
                let err = this.record_error(BodyReaderError::ConnectionReset);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Ok(chunk))) => {
                let total = this.counted.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
                if total > this.ceiling {
                    let err = this.record_error(BodyReaderError::SizeExceeded);
                    return Poll::Ready(Some(Err(err)));
                }
                if let (Some(timeout), Some(deadline)) = (this.read_timeout, this.deadline.as_mut()) {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                if let Some(cb) = &this.on_read_done {
                    cb(chunk.len() as u64);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
        }
    }
}

/// Adapts a [`CountingBodyReader`]'s `Result<Bytes, BodyReaderError>` stream
/// into the `std::io::Error` item type [`crate::stores::ByteStream`] expects.
pub fn into_byte_stream<S, E>(reader: CountingBodyReader<S>) -> crate::stores::ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    use futures_util::StreamExt;
    Box::pin(reader.map(|item| {
        item.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{e:?}")))
    }))
}

/// Resolves a sticky [`BodyReaderError`] into the [`TusResult`] a handler
/// returns when a write comes back short.
pub fn classify_short_write(reader_error: Option<BodyReaderError>) -> TusResult<()> {
    match reader_error {
        None => Ok(()),
        Some(err) => Err(err.into()),
    }
}
