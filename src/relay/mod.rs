// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The Relay role: a caching, coalescing proxy in front of an upstream.
//!
//! A Relay speaks the same contract as a Server, so Clients (and other
//! Relays) cannot tell the two apart. Positions are the root Server's
//! values, carried through untouched in both directions.
//!
//! # Serving a request
//!
//! ```text
//! stream_from(source, P)
//!   loop:
//!     next_after(P) ──► cache hit?  ──► yes: event
//!                       │
//!                       └─ no: join / start a coalesced upstream fetch
//!     send event, P = event.position
//! ```
//!
//! See [`cache`] for the contiguity rule that keeps hits gap-free and
//! `coalesce` for how concurrent misses share one upstream stream.

pub mod cache;
mod coalesce;

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::config::{RelayConfig, SessionConfig};
use crate::error::{ReplicationError, Result};
use crate::event::{Event, EventStream};
use crate::listener;
use crate::metrics;
use crate::position::{display_after, CanonicalPosition};
use crate::source::BoxFuture;
use crate::upstream::{RemoteUpstream, Upstream};
use cache::SourceCache;
use coalesce::SourceRelay;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};

struct RelayInner {
    name: String,
    sources: DashMap<String, Arc<SourceRelay>>,
    cache_capacity: usize,
    max_entry_age: Option<Duration>,
    read_ahead_events: usize,
    circuit: CircuitConfig,
    session: SessionConfig,
}

/// Caching relay. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Create a relay with no upstreams.
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                name: config.listen_addr.clone(),
                sources: DashMap::new(),
                cache_capacity: config.cache.capacity,
                max_entry_age: config.cache.max_entry_age(),
                read_ahead_events: config.cache.read_ahead_events,
                circuit: config.circuit_config(),
                session: config.session.clone(),
            }),
        }
    }

    /// Build a relay with a [`RemoteUpstream`] per configured source.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let relay = Self::new(config);
        for upstream in &config.upstreams {
            let remote = RemoteUpstream::new(&upstream.upstream_addr)
                .with_connect_timeout(config.connect_timeout())
                .with_stream_buffer(config.session.stream_buffer);
            relay.add_upstream(&upstream.source_id, Arc::new(remote))?;
        }
        Ok(relay)
    }

    /// Route `source_id` to `upstream`.
    pub fn add_upstream(&self, source_id: &str, upstream: Arc<dyn Upstream>) -> Result<()> {
        if self.inner.sources.contains_key(source_id) {
            return Err(ReplicationError::Config(format!(
                "duplicate relay upstream for {}",
                source_id
            )));
        }
        info!(
            relay = %self.inner.name,
            source_id = %source_id,
            upstream = %upstream.endpoint(),
            "Registered relay upstream"
        );
        let source = SourceRelay::new(
            source_id.to_string(),
            upstream,
            SourceCache::new(self.inner.cache_capacity, self.inner.max_entry_age),
            CircuitBreaker::new(format!("relay_upstream:{}", source_id), self.inner.circuit.clone()),
            self.inner.read_ahead_events,
        );
        self.inner.sources.insert(source_id.to_string(), Arc::new(source));
        Ok(())
    }

    fn source(&self, source_id: &str) -> Result<Arc<SourceRelay>> {
        self.inner
            .sources
            .get(source_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ReplicationError::UnknownSource {
                source_id: source_id.to_string(),
            })
    }

    /// The event right after `after`, served from cache or fetched upstream.
    pub async fn next_after(&self, source_id: &str, after: Option<CanonicalPosition>) -> Result<Arc<Event>> {
        let source = self.source(source_id)?;
        source.next_after(after).await
    }

    /// Stream every event after `after`, like [`Server::stream_from`](crate::Server::stream_from).
    pub fn stream_from(&self, source_id: &str, after: Option<CanonicalPosition>) -> Result<EventStream> {
        let source = self.source(source_id)?;
        let (tx, events) = EventStream::channel(self.inner.session.stream_buffer);
        let source_id = source_id.to_string();

        debug!(source_id = %source_id, after = %display_after(after), "Starting relay stream");
        let span = info_span!("relay_session", source_id = %source_id);
        tokio::spawn(
            async move {
                let mut cursor = after;
                loop {
                    let next = tokio::select! {
                        _ = tx.closed() => return,
                        next = source.next_after(cursor) => next,
                    };
                    match next {
                        Ok(event) => {
                            cursor = Some(event.position);
                            if tx.send(Ok(Event::clone(&event))).await.is_err() {
                                return;
                            }
                            metrics::record_events_served("relay", &source_id, 1);
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(events)
    }

    /// Relayed source IDs.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Cached entries for a source (0 if unknown).
    pub async fn cache_len(&self, source_id: &str) -> usize {
        match self.source(source_id) {
            Ok(source) => source.cache_len().await,
            Err(_) => 0,
        }
    }

    /// Upstream fetches currently open for a source.
    pub async fn active_fetches(&self, source_id: &str) -> usize {
        match self.source(source_id) {
            Ok(source) => source.active_fetches().await,
            Err(_) => 0,
        }
    }

    /// Endpoint of the upstream a source is relayed from.
    pub fn upstream_endpoint(&self, source_id: &str) -> Option<String> {
        self.source(source_id)
            .ok()
            .map(|source| source.upstream().endpoint().to_string())
    }

    /// Drop expired cache entries of every source. Returns entries evicted.
    pub async fn purge_expired(&self) -> usize {
        let sources: Vec<Arc<SourceRelay>> = self.inner.sources.iter().map(|e| e.value().clone()).collect();
        let mut evicted = 0;
        for source in sources {
            evicted += source.purge_expired().await;
        }
        evicted
    }

    /// Serve the wire protocol on `listener` until `shutdown` flips to true.
    ///
    /// With a maximum entry age configured, expired entries are also swept
    /// periodically so a quiet source does not pin them.
    pub async fn serve(&self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        let sweeper = self
            .inner
            .max_entry_age
            .map(|age| tokio::spawn(self.clone().sweep_expired(age, shutdown.clone())));

        let session = self.inner.session.clone();
        let result = listener::serve(Arc::new(self.clone()), listener, &session, shutdown).await;

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    async fn sweep_expired(self, max_age: Duration, mut shutdown: watch::Receiver<bool>) {
        let period = (max_age / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = listener::shutdown_signalled(&mut shutdown) => return,
                _ = ticker.tick() => {
                    let evicted = self.purge_expired().await;
                    if evicted > 0 {
                        debug!(relay = %self.inner.name, evicted, "Swept expired cache entries");
                    }
                }
            }
        }
    }
}

impl Upstream for Relay {
    fn endpoint(&self) -> &str {
        &self.inner.name
    }

    fn open<'a>(&'a self, source_id: &'a str, after: Option<CanonicalPosition>) -> BoxFuture<'a, EventStream> {
        Box::pin(async move { self.stream_from(source_id, after) })
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("name", &self.inner.name)
            .field("sources", &self.source_ids())
            .finish()
    }
}
