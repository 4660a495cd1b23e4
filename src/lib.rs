// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Mesh Replication
//!
//! Decentralized multi-master replication: every node owns an ordered event
//! log for its source, and any node can pull any source, directly from the
//! owner or through a chain of caching relays.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐      ┌──────────────────────┐
//! │    Server    │─────►│    Relay     │─────►│    Relay     │─────►│       Client         │
//! │ (event log)  │ TCP  │ (cache +     │ TCP  │ (cache +     │ TCP  │ apply + checkpoint   │
//! │              │      │  coalescing) │      │  coalescing) │      │ in one transaction   │
//! └──────────────┘      └──────────────┘      └──────────────┘      └──────────────────────┘
//! ```
//!
//! Each hop speaks the same two requests: `Connect(source_id)` and
//! `StreamFrom(after)`. Positions are [`CanonicalPosition`]s, so every hop
//! agrees on where a stream resumes.
//!
//! ## Roles
//!
//! 1. **Server**: serves a source's own log, waiting at the head for new events
//! 2. **Relay**: serves sources it pulls from upstream, caching contiguous runs
//!    and sharing one upstream fetch among concurrent downstream requests
//! 3. **Client**: applies each event and its position atomically, so a crash
//!    never applies an event twice or skips one
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mesh_replication::{
//!     ClientConfig, PositionStoreConfig, ReplicationEngine, SqlStatementApplier, UpstreamConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new(
//!         vec![UpstreamConfig::new("orders", "10.0.0.7:7300")],
//!         PositionStoreConfig::default(),
//!     );
//!
//!     let mut engine = ReplicationEngine::new(config, Arc::new(SqlStatementApplier));
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod applier;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod listener;
pub mod metrics;
pub mod position;
pub mod position_store;
pub mod protocol;
pub mod relay;
pub mod resilience;
pub mod server;
pub mod source;
pub mod upstream;

// Re-exports for convenience
pub use applier::{ApplyError, Applier, SqlStatementApplier};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use client::{ClientState, ReplicationClient};
pub use config::{
    CacheConfig, ClientConfig, PositionStoreConfig, RelayConfig, ReplicationConfig, ServerConfig, SessionConfig,
    SourceConfig, UpstreamConfig,
};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine, SourceHealth};
pub use error::{ReplicationError, Result};
pub use event::{Event, EventStream};
pub use position::CanonicalPosition;
pub use position_store::{CheckpointOutcome, PositionStore};
pub use relay::Relay;
pub use server::Server;
pub use source::{EventSource, MemoryEventLog, SqliteEventLog};
pub use upstream::{RemoteUpstream, Upstream};
