// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Mesh Replication
//!
//! Every test runs real roles over loopback TCP; no external services needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `wire_*` - a Client reading a Server or Relay over the wire protocol
//! - `chain_*` - Server → Relay → Relay → Client topologies
//! - `engine_*` - engine lifecycle and restarts against a file-backed store

mod common;

use common::{
    eventually, insert, kv_rows, memory_store, p, prepare_file_store, spawn_relay, spawn_server, CountingUpstream,
};
use mesh_replication::config::{ClientConfig, PositionStoreConfig, UpstreamConfig};
use mesh_replication::{
    ClientState, EngineState, MemoryEventLog, PositionStore, RemoteUpstream, ReplicationClient, ReplicationEngine,
    ReplicationError, SqlStatementApplier, SqliteEventLog, Upstream,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Wire Protocol
// =============================================================================

#[tokio::test]
async fn wire_stream_from_server_in_order() {
    let log = Arc::new(
        MemoryEventLog::with_events(
            "orders",
            vec![(p(0, 100), b"a".to_vec()), (p(0, 250), b"b".to_vec()), (p(1, 10), b"c".to_vec())],
        )
        .await
        .unwrap(),
    );
    let (_server, listening) = spawn_server(log.clone()).await;

    let remote = RemoteUpstream::new(listening.addr());
    let mut stream = remote.open("orders", Some(p(0, 100))).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().position, p(0, 250));
    assert_eq!(stream.next().await.unwrap().unwrap().position, p(1, 10));

    // Stream waits at the head for the next append
    log.append(p(1, 20), b"d".to_vec()).await.unwrap();
    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.position, p(1, 20));
    assert_eq!(event.payload, b"d");

    listening.stop().await;
}

#[tokio::test]
async fn wire_errors_map_to_typed_errors() {
    let log = Arc::new(
        MemoryEventLog::with_events("orders", vec![(p(2, 0), b"x".to_vec())])
            .await
            .unwrap(),
    );
    let (_server, listening) = spawn_server(log).await;
    let remote = RemoteUpstream::new(listening.addr());

    // Remote refusals arrive as the terminal stream item
    let mut stream = remote.open("missing", None).await.unwrap();
    match stream.next().await {
        Some(Err(ReplicationError::UnknownSource { source_id })) => assert_eq!(source_id, "missing"),
        other => panic!("expected UnknownSource, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    let mut stream = remote.open("orders", Some(p(9, 0))).await.unwrap();
    match stream.next().await {
        Some(Err(ReplicationError::PositionNotAvailable { requested, .. })) => {
            assert_eq!(requested, Some(p(9, 0)))
        }
        other => panic!("expected PositionNotAvailable, got {other:?}"),
    }

    listening.stop().await;
}

#[tokio::test]
async fn wire_large_payloads_survive_compression() {
    let big = "x".repeat(100_000);
    let log = Arc::new(
        MemoryEventLog::with_events("orders", vec![(p(0, 1), big.clone().into_bytes())])
            .await
            .unwrap(),
    );
    let (_server, listening) = spawn_server(log).await;

    let mut stream = RemoteUpstream::new(listening.addr()).open("orders", None).await.unwrap();
    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.payload.len(), big.len());
    assert_eq!(event.payload, big.as_bytes());

    listening.stop().await;
}

// =============================================================================
// Chains
// =============================================================================

#[tokio::test]
async fn chain_server_relay_relay_client() {
    let dir = tempdir().unwrap();
    let log = Arc::new(
        SqliteEventLog::open("orders", dir.path().join("orders_log.db"))
            .await
            .unwrap(),
    );
    for (i, pos) in [p(0, 100), p(0, 250), p(1, 10)].into_iter().enumerate() {
        log.append(pos, insert(&format!("k{i}"), "v")).await.unwrap();
    }

    let (_server, server_l) = spawn_server(log.clone()).await;
    let (relay_a, relay_a_l) = spawn_relay(&["orders"], &server_l.addr()).await;
    let (_relay_b, relay_b_l) = spawn_relay(&["orders"], &relay_a_l.addr()).await;

    let store = memory_store().await;
    let client = Arc::new(ReplicationClient::new(
        "orders",
        Arc::new(RemoteUpstream::new(relay_b_l.addr())),
        store.clone(),
        Arc::new(SqlStatementApplier),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.run(shutdown_rx).await }
    });

    assert!(
        eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(1, 10)) }).await,
        "client never reached the head through two relays"
    );
    assert_eq!(kv_rows(&store).await.len(), 3);
    // The first relay cached the whole run
    assert_eq!(relay_a.cache_len("orders").await, 3);

    // New writes flow through the chain without reconnecting
    log.append(p(2, 0), insert("k3", "v")).await.unwrap();
    assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(2, 0)) }).await);
    assert_eq!(client.reconnects(), 0);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(client.state(), ClientState::Stopped);

    relay_b_l.stop().await;
    relay_a_l.stop().await;
    server_l.stop().await;
}

#[tokio::test]
async fn chain_concurrent_clients_share_one_upstream_open() {
    let log = Arc::new(
        MemoryEventLog::with_events(
            "orders",
            (1..=20).map(|i| (p(0, i), insert(&format!("k{i}"), "v"))).collect::<Vec<_>>(),
        )
        .await
        .unwrap(),
    );
    let (server, server_l) = spawn_server(log).await;
    let counting = Arc::new(CountingUpstream::new(server).with_open_delay(Duration::from_millis(50)));

    let relay = mesh_replication::Relay::new(&mesh_replication::RelayConfig::for_testing());
    relay.add_upstream("orders", counting.clone()).unwrap();
    let relay: Arc<dyn Upstream> = Arc::new(relay);

    let mut stores = Vec::new();
    let mut tasks = Vec::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for _ in 0..4 {
        let store = memory_store().await;
        let client = ReplicationClient::new("orders", relay.clone(), store.clone(), Arc::new(SqlStatementApplier));
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { client.run(rx).await }));
        stores.push(store);
    }

    for store in &stores {
        assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(0, 20)) }).await);
        assert_eq!(kv_rows(store).await.len(), 20);
    }
    assert_eq!(counting.opens(), 1, "concurrent misses at the same position coalesce");

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    server_l.stop().await;
}

#[tokio::test]
async fn chain_client_switches_from_relay_to_server() {
    let log = Arc::new(
        MemoryEventLog::with_events("orders", vec![(p(0, 1), insert("a", "1")), (p(0, 2), insert("b", "2"))])
            .await
            .unwrap(),
    );
    let (_server, server_l) = spawn_server(log.clone()).await;
    let (_relay, relay_l) = spawn_relay(&["orders"], &server_l.addr()).await;
    let store = memory_store().await;

    // First pass through the relay
    let via_relay = ReplicationClient::new(
        "orders",
        Arc::new(RemoteUpstream::new(relay_l.addr())),
        store.clone(),
        Arc::new(SqlStatementApplier),
    );
    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { via_relay.run(rx).await });
    assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(0, 2)) }).await);
    tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    relay_l.stop().await;

    // Resume directly from the server with the same saved position
    log.append(p(0, 3), insert("c", "3")).await.unwrap();
    let direct = ReplicationClient::new(
        "orders",
        Arc::new(RemoteUpstream::new(server_l.addr())),
        store.clone(),
        Arc::new(SqlStatementApplier),
    );
    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { direct.run(rx).await });
    assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(0, 3)) }).await);
    tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let rows = kv_rows(&store).await;
    assert_eq!(
        rows,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("c".to_string(), "3".to_string()),
        ]
    );
    server_l.stop().await;
}

// =============================================================================
// Engine
// =============================================================================

#[tokio::test]
async fn engine_restart_resumes_without_duplicates() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("positions.db");
    prepare_file_store(&store_path).await;

    let log = Arc::new(
        MemoryEventLog::with_events("orders", vec![(p(0, 1), insert("a", "1")), (p(0, 2), insert("b", "2"))])
            .await
            .unwrap(),
    );
    let (_server, server_l) = spawn_server(log.clone()).await;

    let mut config = ClientConfig::for_testing(vec![UpstreamConfig::new("orders", server_l.addr())]);
    config.position_store = PositionStoreConfig {
        sqlite_path: store_path.to_string_lossy().to_string(),
        wal_mode: true,
    };

    let mut engine = ReplicationEngine::new(config.clone(), Arc::new(SqlStatementApplier));
    engine.start().await.unwrap();
    let store = engine.position_store().unwrap().clone();
    assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(0, 2)) }).await);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    // Written while the node was down
    log.append(p(0, 3), insert("c", "3")).await.unwrap();

    let mut engine = ReplicationEngine::new(config, Arc::new(SqlStatementApplier));
    engine.start().await.unwrap();
    let store = engine.position_store().unwrap().clone();
    assert!(eventually(WAIT, || async { store.get("orders").await.unwrap() == Some(p(0, 3)) }).await);

    // A re-applied INSERT would have hit the primary key and halted the source
    let health = engine.health_check().await;
    assert!(health.healthy, "{health:?}");
    assert_eq!(health.sources[0].applied, 1);
    assert_eq!(kv_rows(&store).await.len(), 3);

    engine.shutdown().await;
    server_l.stop().await;

    let reopened = PositionStore::new(&store_path).await.unwrap();
    assert_eq!(reopened.get("orders").await.unwrap(), Some(p(0, 3)));
    reopened.close().await;
}

#[tokio::test]
async fn engine_reports_streaming_sources() {
    let log = Arc::new(MemoryEventLog::new("orders"));
    let (_server, server_l) = spawn_server(log.clone()).await;

    let config = ClientConfig::for_testing(vec![UpstreamConfig::new("orders", server_l.addr())]);
    let mut engine = ReplicationEngine::new(config, Arc::new(SqlStatementApplier))
        .with_position_store(memory_store().await);
    engine.start().await.unwrap();

    engine
        .wait_for_state("orders", ClientState::Streaming, WAIT)
        .await
        .unwrap();
    let health = engine.health_check().await;
    assert!(health.ready);
    assert_eq!(health.sources_streaming, 1);
    assert_eq!(health.sources[0].upstream, server_l.addr());
    assert_eq!(health.sources[0].position, None);

    engine.shutdown().await;
    server_l.stop().await;
}
