// tests/common/mod.rs
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tabular_ingest::ingest::fetcher::{Backoff, HttpFetcher};
use tabular_ingest::ingest::normalize::Normalizer;
use tabular_ingest::ingest::sqlite::SqliteStore;
use tabular_ingest::ingest::store::StorageWriter;
use tabular_ingest::{Orchestrator, PipelineSettings, SourceDescriptor, SourceSpec};

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn fast_fetcher() -> HttpFetcher {
    HttpFetcher::new(Backoff::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
    ))
    .unwrap()
}

pub fn rest(addr: SocketAddr, path: &str, label: &str) -> SourceDescriptor {
    SourceSpec::rest(format!("http://{addr}{path}"))
        .label(label)
        .timeout_secs(5)
        .build()
        .unwrap()
}

pub fn sqlite_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("db/ingest.db").display())
}

pub fn orchestrator(dir: &Path, settings: PipelineSettings) -> Orchestrator {
    let store = SqliteStore::connect_lazy(&sqlite_url(dir), 4).unwrap();
    Orchestrator::new(
        Arc::new(fast_fetcher()),
        Arc::new(Normalizer::default()),
        Arc::new(StorageWriter::new(Arc::new(store))),
        settings,
    )
}
