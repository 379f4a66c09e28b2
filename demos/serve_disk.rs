//! Runnable demo wiring `DiskStore` + `MemoryLocker` behind a real listener.
//!
//! ```sh
//! cargo run --bin serve-disk
//! ```
//!
//! Uploads land under `./tus-upload-files`, expire after an hour of
//! inactivity, and the router is mounted at `/files`.

use std::time::Duration;

use salvo_core::conn::TcpListener;
use salvo_core::{Router, Server};
use tracing_subscriber::EnvFilter;
use tus_server_core::{DiskStore, MemoryLocker, Tus};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = DiskStore::new()
        .disk_root("./tus-upload-files")
        .with_expiration(Duration::from_secs(3600));

    let tus = Tus::new()
        .with_store(store)
        .with_locker(MemoryLocker::new())
        .with_acquire_lock_timeout(Duration::from_secs(30));

    let router = Router::new().push(tus.into_router());

    let acceptor = TcpListener::new("0.0.0.0:8080").bind().await;
    tracing::info!("tus demo server listening on 0.0.0.0:8080");
    Server::new(acceptor).serve(router).await;
}
