// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Position and payload helpers
//! - Servers and relays listening on ephemeral TCP ports
//! - An upstream wrapper counting `open` calls
//! - Position stores pre-seeded with the `kv` test table

#![allow(dead_code)]

use mesh_replication::config::{RelayConfig, SessionConfig, UpstreamConfig};
use mesh_replication::source::BoxFuture;
use mesh_replication::{CanonicalPosition, EventSource, EventStream, PositionStore, Relay, Server, Upstream};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn p(log_file_index: u64, offset: u64) -> CanonicalPosition {
    CanonicalPosition::new(log_file_index, offset)
}

/// SQL payload inserting one row into `kv`.
pub fn insert(key: &str, value: &str) -> Vec<u8> {
    format!("INSERT INTO kv (k, v) VALUES ('{key}', '{value}')").into_bytes()
}

pub const KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT NOT NULL)";

/// Create the `kv` table through a store's pool.
pub async fn create_kv(store: &PositionStore) {
    sqlx::query(KV_SCHEMA).execute(store.pool()).await.unwrap();
}

pub async fn memory_store() -> Arc<PositionStore> {
    let store = PositionStore::in_memory().await.unwrap();
    create_kv(&store).await;
    Arc::new(store)
}

/// File-backed store with the `kv` table, closed again so an engine can
/// open the same path.
pub async fn prepare_file_store(path: &Path) {
    let store = PositionStore::new(path).await.unwrap();
    create_kv(&store).await;
    store.close().await;
}

pub async fn kv_rows(store: &PositionStore) -> Vec<(String, String)> {
    sqlx::query_as("SELECT k, v FROM kv ORDER BY k")
        .fetch_all(store.pool())
        .await
        .unwrap()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A listening role and the means to stop it.
pub struct Listening {
    pub addr: SocketAddr,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

impl Listening {
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.handle).await;
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Serve `source` from a Server on an ephemeral port.
pub async fn spawn_server(source: Arc<dyn EventSource>) -> (Arc<Server>, Listening) {
    let server = Arc::new(Server::new(SessionConfig::for_testing()).with_source(source).unwrap());
    let (listener, addr) = bind().await;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let server = server.clone();
        async move {
            let _ = server.serve(listener, shutdown_rx).await;
        }
    });
    (server, Listening { addr, shutdown, handle })
}

/// Relay `source_ids` from `upstream_addr`, listening on an ephemeral port.
pub async fn spawn_relay(source_ids: &[&str], upstream_addr: &str) -> (Relay, Listening) {
    let (listener, addr) = bind().await;
    let mut config = RelayConfig::for_testing();
    config.listen_addr = addr.to_string();
    config.upstreams = source_ids
        .iter()
        .map(|id| UpstreamConfig::new(*id, upstream_addr))
        .collect();
    let relay = Relay::from_config(&config).unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = relay.clone();
        async move {
            let _ = relay.serve(listener, shutdown_rx).await;
        }
    });
    (relay, Listening { addr, shutdown, handle })
}

/// Upstream wrapper counting `open` calls, optionally slowing each open down.
pub struct CountingUpstream {
    inner: Arc<dyn Upstream>,
    opens: AtomicUsize,
    open_delay: Duration,
}

impl CountingUpstream {
    pub fn new(inner: Arc<dyn Upstream>) -> Self {
        Self {
            inner,
            opens: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Upstream for CountingUpstream {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn open<'a>(&'a self, source_id: &'a str, after: Option<CanonicalPosition>) -> BoxFuture<'a, EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            self.inner.open(source_id, after).await
        })
    }
}
