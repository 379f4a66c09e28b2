//! TUS (Resumable Upload Protocol) implementation for the Salvo web framework.
//!
//! [TUS](https://tus.io/) is an open protocol for resumable file uploads over HTTP.
//! It allows reliable uploads of large files by enabling pause and resume functionality,
//! making it ideal for unreliable network conditions.
//!
//! # Features
//!
//! - Resumable uploads - Clients can resume interrupted uploads
//! - Upload metadata - Attach custom metadata to uploads
//! - Configurable max size - Limit upload file sizes
//! - Lifecycle hooks - React to upload events
//! - Customizable storage - Implement your own storage backend
//!
//! # Example
//!
//! ```ignore
//! use tus_server_core::{Tus, MaxSize};
//! use salvo_core::prelude::*;
//!
//! let tus = Tus::new()
//!     .path("/uploads")
//!     .max_size(MaxSize::Fixed(100 * 1024 * 1024));  // 100 MB limit
//!
//! let router = Router::new()
//!     .push(tus.into_router());
//!
//! let acceptor = TcpListener::new("0.0.0.0:8080").bind().await;
//! Server::new(acceptor).serve(router).await;
//! ```
//!
//! # TUS Protocol Endpoints
//!
//! The router created by `into_router()` handles:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | OPTIONS | `/uploads` | Returns TUS protocol capabilities |
//! | POST | `/uploads` | Creates a new upload |
//! | HEAD | `/uploads/{id}` | Returns upload progress |
//! | PATCH | `/uploads/{id}` | Uploads a chunk |
//! | DELETE | `/uploads/{id}` | Cancels an upload |
//! | GET | `/uploads/{id}` | Downloads the uploaded file |
//!
//! # Lifecycle Hooks
//!
//! React to upload events:
//!
//! ```ignore
//! let tus = Tus::new()
//!     .with_on_upload_create(|req, upload_info| async move {
//!         println!("New upload: {:?}", upload_info);
//!         Ok(UploadPatch::default())
//!     })
//!     .with_on_upload_finish(|req, upload_info| async move {
//!         println!("Upload complete: {:?}", upload_info);
//!         Ok(UploadFinishPatch::default())
//!     });
//! ```
//!
//! # Custom Upload ID
//!
//! Generate custom upload IDs:
//!
//! ```ignore
//! let tus = Tus::new()
//!     .with_upload_id_naming_function(|req, metadata| async move {
//!         Ok(uuid::Uuid::new_v4().to_string())
//!     });
//! ```
//!
//! # Storage Backends
//!
//! By default, files are stored on disk using `DiskStore`.
//! Implement `DataStore` trait for custom storage (S3, database, etc.).
//!
//! Read more: <https://salvo.rs>

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Span;

use crate::handlers::{GenerateUrlCtx, Metadata};
use crate::options::{MaxSize, TusOptions, UploadFinishPatch, UploadPatch};
use crate::utils::normalize_path;

mod body;
mod context;
mod cors;
mod error;
mod handlers;

pub mod events;
pub mod lockers;
pub mod options;
pub mod stores;
pub mod utils;

pub use body::{BodyReaderError, CountingBodyReader};
pub use context::RequestContext;
pub use error::{ProtocolError, TusError, TusResult};
pub use events::{TusEvent, TusEventBus};
pub use lockers::{Locker, MemoryLocker, UploadLock};
pub use stores::{DataStore, DiskStore, Extension, StoreInfo, UploadInfo};

use salvo_core::{Depot, Request, Response, Router, handler};

pub const TUS_VERSION: &str = "1.0.0";
pub const H_TUS_RESUMABLE: &str = "tus-resumable";
pub const H_TUS_VERSION: &str = "tus-version";
pub const H_TUS_EXTENSION: &str = "tus-extension";
pub const H_TUS_MAX_SIZE: &str = "tus-max-size";

pub const H_ACCESS_CONTROL_ALLOW_METHODS: &str = "access-control-allow-methods";
pub const H_ACCESS_CONTROL_ALLOW_HEADERS: &str = "access-control-allow-headers";
pub const H_ACCESS_CONTROL_REQUEST_HEADERS: &str = "access-control-request-headers";
pub const H_ACCESS_CONTROL_MAX_AGE: &str = "access-control-max-age";

pub const H_UPLOAD_LENGTH: &str = "upload-length";
pub const H_UPLOAD_OFFSET: &str = "upload-offset";
pub const H_UPLOAD_METADATA: &str = "upload-metadata";
pub const H_UPLOAD_CONCAT: &str = "upload-concat";
pub const H_UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const H_UPLOAD_EXPIRES: &str = "upload-expires";

pub const H_UPLOAD_DRAFT_INTEROP_VERSION: &str = "upload-draft-interop-version";
pub const H_UPLOAD_COMPLETE: &str = "upload-complete";
pub const H_UPLOAD_INCOMPLETE: &str = "upload-incomplete";
pub const H_CONTENT_DISPOSITION: &str = "content-disposition";

pub const H_CONTENT_TYPE: &str = "content-type";
pub const H_CONTENT_LENGTH: &str = "content-length";
pub const CT_OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancellationReason {
    Abort,
    Cancel,
}

#[derive(Clone, Debug)]
pub struct CancellationSignal {
    receiver: watch::Receiver<Option<CancellationReason>>,
}

impl CancellationSignal {
    pub fn reason(&self) -> Option<CancellationReason> {
        *self.receiver.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.reason(), Some(CancellationReason::Abort))
    }

    pub async fn cancelled(&mut self) -> CancellationReason {
        loop {
            if let Some(reason) = *self.receiver.borrow() {
                return reason;
            }
            if self.receiver.changed().await.is_err() {
                return CancellationReason::Cancel;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct CancellationContext {
    pub signal: CancellationSignal,
    sender: watch::Sender<Option<CancellationReason>>,
}

impl CancellationContext {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            signal: CancellationSignal { receiver },
            sender,
        }
    }

    pub fn abort(&self) {
        let _ = self.sender.send(Some(CancellationReason::Abort));
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(Some(CancellationReason::Cancel));
    }
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct TusStateHoop {
    state: Arc<Tus>,
}

#[handler]
impl TusStateHoop {
    async fn handle(
        &self,
        req: &mut Request,
        depot: &mut Depot,
        res: &mut Response,
        ctrl: &mut salvo_core::FlowCtrl,
    ) {
        depot.inject(self.state.clone());

        if req.method() == salvo_core::http::Method::POST
            && let Some(overridden) = req
                .headers()
                .get("x-http-method-override")
                .and_then(|v| v.to_str().ok())
            && let Ok(method) = overridden.parse::<salvo_core::http::Method>()
        {
            *req.method_mut() = method;
        }

        if let Err(()) = crate::cors::apply(&self.state.options, req, res) {
            ctrl.skip_rest();
        }
    }
}

/// Top-level handle a handler uses to reach storage, options, and the event
/// bus. Every verb handler pulls this out of the [`Depot`] via
/// [`TusStateHoop`].
#[derive(Clone)]
pub struct Tus {
    options: TusOptions,
    store: Arc<dyn DataStore>,
    events: TusEventBus,
    shutdown: CancellationContext,
}
impl Default for Tus {
    fn default() -> Self {
        Self::new()
    }
}

// Tus service Configuration
impl Tus {
    pub fn new() -> Self {
        Self {
            options: TusOptions::default(),
            store: Arc::new(DiskStore::new()),
            events: TusEventBus::default(),
            shutdown: CancellationContext::new(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.options.path = path.into();
        self
    }

    pub fn max_size(mut self, max_size: MaxSize) -> Self {
        self.options.max_size = Some(max_size);
        self
    }

    pub fn relative_location(mut self, yes: bool) -> Self {
        self.options.relative_location = yes;
        self
    }

    pub fn with_store(mut self, store: impl DataStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn with_locker(mut self, locker: impl Locker) -> Self {
        self.options.locker = Arc::new(locker);
        self
    }

    pub fn with_acquire_lock_timeout(mut self, timeout: Duration) -> Self {
        self.options.acquire_lock_timeout = timeout;
        self
    }

    pub fn with_graceful_completion(mut self, duration: Duration) -> Self {
        self.options.graceful_completion = duration;
        self
    }

    /// Sets the rolling network read deadline applied to every incoming
    /// upload body.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.options.network_timeout = timeout;
        self
    }

    pub fn with_rufh_interop(mut self, enabled: bool) -> Self {
        self.options.rufh_enabled = enabled;
        self
    }

    /// Subscribes to upload lifecycle notifications (`Created`, `Progress`,
    /// `Completed`, `Terminated`). Purely observational: a lagging or absent
    /// subscriber never affects request handling.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TusEvent> {
        self.events.subscribe()
    }

    /// Builds a fresh per-request [`RequestContext`], wired so that calling
    /// [`Tus::shutdown`] aborts every request context handed out from this
    /// instance.
    pub(crate) fn new_request_context(&self, span: Span) -> RequestContext {
        let ctx = RequestContext::new(span, self.options.graceful_completion);
        let mut shutdown_signal = self.shutdown.signal.clone();
        let watched = ctx.clone();
        tokio::spawn(async move {
            shutdown_signal.cancelled().await;
            watched.cancel(CancellationReason::Abort);
        });
        ctx
    }

    pub(crate) fn events(&self) -> &TusEventBus {
        &self.events
    }

    /// Cancels every in-flight request's context with
    /// [`CancellationReason::Abort`], giving each handler's store write
    /// `graceful_completion` to finish durably before its delayed token also
    /// fires.
    pub fn shutdown(&self) {
        self.shutdown.abort();
    }

    pub fn into_router(self) -> Router {
        let base_path = normalize_path(&self.options.path);
        let state = Arc::new(self);

        Router::with_path(base_path)
            .hoop(TusStateHoop {
                state: state.clone(),
            })
            .push(handlers::options_handler())
            .push(handlers::post_handler())
            .push(handlers::head_handler())
            .push(handlers::patch_handler())
            .push(handlers::delete_handler())
            .push(handlers::get_handler())
    }
}

// Hooks
impl Tus {
    pub fn with_upload_id_naming_function<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&Request, Option<Metadata>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, TusError>> + Send + 'static,
    {
        self.options.upload_id_naming_function = Arc::new(move |req, meta| Box::pin(f(req, meta)));
        self
    }

    pub fn with_generate_url_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, GenerateUrlCtx) -> Result<String, TusError> + Send + Sync + 'static,
    {
        self.options.generate_url_function = Some(Arc::new(f));
        self
    }
}

// Lifecycle
impl Tus {
    pub fn with_on_incoming_request<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&Request, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.options.on_incoming_request = Some(Arc::new(move |req, id| Box::pin(f(req, id))));
        self
    }

    pub fn with_on_incoming_request_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, String) + Send + Sync + 'static,
    {
        self.options.on_incoming_request = Some(Arc::new(move |req, id| {
            f(req, id);
            Box::pin(async move {})
        }));
        self
    }

    pub fn with_on_upload_create<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&Request, UploadInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UploadPatch, TusError>> + Send + 'static,
    {
        self.options.on_upload_create = Some(Arc::new(move |req, upload| Box::pin(f(req, upload))));
        self
    }

    pub fn with_on_upload_finish<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&Request, UploadInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UploadFinishPatch, TusError>> + Send + 'static,
    {
        self.options.on_upload_finish = Some(Arc::new(move |req, upload| Box::pin(f(req, upload))));
        self
    }
}
