// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coalesced upstream fetches for one relayed source.
//!
//! A cache miss never opens an upstream stream by itself. It registers a
//! waiter with a *fetch*: one upstream stream plus the set of downstream
//! requests it is currently answering.
//!
//! ```text
//!            ┌────────── groups (per-source mutex) ──────────┐
//! miss(P) ──►│ fetch whose frontier is exactly P ?  join it  │
//!            │ none ?  new fetch keyed at P, spawn its pump  │
//!            └───────────────────────────────────────────────┘
//!
//! pump: upstream.open(key) ─► event E (prev = frontier)
//!         lock groups
//!           cache.insert(E, prev)          (before anyone is released)
//!           release waiters with after < E
//!           frontier = E
//!           absorb fetches whose frontier lies in [prev, E)
//!         unlock
//! ```
//!
//! A fetch's frontier is always a position the upstream has vouched for:
//! either the key it accepted when the stream opened, or an event it sent.
//! Joining only at the frontier means a request beyond the upstream's head
//! can never hide inside someone else's fetch; it opens its own stream and
//! gets the upstream's own `PositionNotAvailable`. Every waiter a fetch
//! holds has `after >= frontier`, so the next upstream event is always the
//! correct answer for the waiters it releases.
//!
//! A fetch with no waiters keeps reading ahead (filling the cache) until
//! `read_ahead_events` consecutive events went unclaimed, then closes its
//! upstream stream.
//!
//! Upstream failure fails the whole fetch: every waiter gets an error and
//! re-issues its own request.

use super::cache::SourceCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::{ReplicationError, Result};
use crate::event::{Event, EventStream};
use crate::metrics;
use crate::position::{display_after, is_after, CanonicalPosition};
use crate::upstream::Upstream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info_span, warn, Instrument};

struct Waiter {
    after: Option<CanonicalPosition>,
    tx: oneshot::Sender<Result<Arc<Event>>>,
}

struct Fetch {
    /// Position the upstream stream was opened after
    key: Option<CanonicalPosition>,
    /// Last position this fetch has seen (starts at `key`)
    frontier: Option<CanonicalPosition>,
    waiters: Vec<Waiter>,
    /// Consecutive events nobody was waiting for
    idle_events: usize,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Groups {
    fetches: HashMap<u64, Fetch>,
    next_id: u64,
}

/// Relay state for one source: its cache, live fetches and upstream.
pub(crate) struct SourceRelay {
    source_id: String,
    upstream: Arc<dyn Upstream>,
    cache: RwLock<SourceCache>,
    groups: Mutex<Groups>,
    breaker: CircuitBreaker,
    read_ahead_events: usize,
}

impl SourceRelay {
    pub(crate) fn new(
        source_id: String,
        upstream: Arc<dyn Upstream>,
        cache: SourceCache,
        breaker: CircuitBreaker,
        read_ahead_events: usize,
    ) -> Self {
        Self {
            source_id,
            upstream,
            cache: RwLock::new(cache),
            groups: Mutex::new(Groups::default()),
            breaker,
            read_ahead_events,
        }
    }

    pub(crate) fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub(crate) async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Drop cache entries past their maximum age.
    pub(crate) async fn purge_expired(&self) -> usize {
        let evicted = self.cache.write().await.purge_expired();
        if evicted > 0 {
            metrics::record_cache_evictions(&self.source_id, evicted);
        }
        evicted
    }

    pub(crate) async fn active_fetches(&self) -> usize {
        self.groups.lock().await.fetches.len()
    }

    /// The event immediately after `after`, from cache or a coalesced fetch.
    pub(crate) async fn next_after(self: &Arc<Self>, after: Option<CanonicalPosition>) -> Result<Arc<Event>> {
        if let Some(event) = self.cache.read().await.lookup_after(after) {
            metrics::record_cache_lookup(&self.source_id, true);
            return Ok(event);
        }

        let rx = {
            let mut groups = self.groups.lock().await;

            // A pump may have filled the gap while we waited for the lock
            if let Some(event) = self.cache.read().await.lookup_after(after) {
                metrics::record_cache_lookup(&self.source_id, true);
                return Ok(event);
            }
            metrics::record_cache_lookup(&self.source_id, false);

            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { after, tx };

            let joinable = groups.fetches.values_mut().find(|fetch| fetch.frontier == after);

            match joinable {
                Some(fetch) => {
                    debug!(
                        source_id = %self.source_id,
                        after = %display_after(after),
                        frontier = %display_after(fetch.frontier),
                        "Joining in-flight fetch"
                    );
                    fetch.waiters.push(waiter);
                    metrics::record_coalesced_waiter(&self.source_id);
                }
                None => {
                    let id = groups.next_id;
                    groups.next_id += 1;
                    groups.fetches.insert(
                        id,
                        Fetch {
                            key: after,
                            frontier: after,
                            waiters: vec![waiter],
                            idle_events: 0,
                            abort: None,
                        },
                    );

                    let span = info_span!("relay_fetch", source_id = %self.source_id, fetch_id = id);
                    let handle = tokio::spawn(self.clone().pump(id, after).instrument(span));
                    // Still under the lock, so nobody can merge this fetch yet
                    if let Some(fetch) = groups.fetches.get_mut(&id) {
                        fetch.abort = Some(handle.abort_handle());
                    }
                }
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::upstream_unavailable(
                &self.source_id,
                "relay fetch abandoned",
            )),
        }
    }

    async fn pump(self: Arc<Self>, id: u64, key: Option<CanonicalPosition>) {
        if let Err(e) = self.run_fetch(id, key).await {
            warn!(
                source_id = %self.source_id,
                after = %display_after(key),
                error = %e,
                "Relay fetch failed"
            );
            self.fail_fetch(id, key, e).await;
        }
    }

    /// Open the upstream through the circuit breaker.
    ///
    /// Only transport-level failures count against the circuit; a definite
    /// answer such as `PositionNotAvailable` means the upstream is healthy.
    async fn open_upstream(&self, key: Option<CanonicalPosition>) -> Result<EventStream> {
        let opened = self
            .breaker
            .call(|| async {
                match self.upstream.open(&self.source_id, key).await {
                    Err(e) if !e.is_retryable() => Ok(Err(e)),
                    other => other.map(Ok),
                }
            })
            .await;

        match opened {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) | Err(CircuitError::Inner(e)) => Err(e),
            Err(CircuitError::Rejected) => Err(ReplicationError::upstream_unavailable(
                &self.source_id,
                format!("circuit open for upstream {}", self.upstream.endpoint()),
            )),
        }
    }

    async fn run_fetch(&self, id: u64, key: Option<CanonicalPosition>) -> Result<()> {
        metrics::record_upstream_fetch(&self.source_id);
        let mut stream = self.open_upstream(key).await?;
        debug!(source_id = %self.source_id, after = %display_after(key), "Upstream fetch opened");

        loop {
            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ReplicationError::upstream_unavailable(
                        &self.source_id,
                        "upstream stream ended",
                    ))
                }
            };

            let mut groups = self.groups.lock().await;
            let Some(fetch) = groups.fetches.get_mut(&id) else {
                // Absorbed by another fetch
                return Ok(());
            };

            let prev = fetch.frontier;
            let position = event.position;
            if !is_after(position, prev) {
                return Err(ReplicationError::Protocol(format!(
                    "upstream sent {} after {}",
                    position,
                    display_after(prev)
                )));
            }

            let event = Arc::new(event);
            let evicted = self.cache.write().await.insert(event.clone(), prev);
            if evicted > 0 {
                metrics::record_cache_evictions(&self.source_id, evicted);
            }

            fetch.frontier = Some(position);
            let mut released = release(&mut fetch.waiters, &event);

            // Fetches parked anywhere in [prev, position) were waiting for this
            // exact event; serve them and take over their remaining waiters.
            let overtaken: Vec<u64> = groups
                .fetches
                .iter()
                .filter(|(other, f)| **other != id && f.frontier >= prev && f.frontier < Some(position))
                .map(|(other, _)| *other)
                .collect();
            let mut absorbed = Vec::new();
            for other in overtaken {
                if let Some(mut merged) = groups.fetches.remove(&other) {
                    released += release(&mut merged.waiters, &event);
                    if let Some(abort) = merged.abort.take() {
                        abort.abort();
                    }
                    absorbed.append(&mut merged.waiters);
                    debug!(source_id = %self.source_id, absorbed_fetch = other, "Merged overtaken fetch");
                }
            }

            let Some(fetch) = groups.fetches.get_mut(&id) else {
                return Ok(());
            };
            fetch.waiters.append(&mut absorbed);

            if released > 0 {
                fetch.idle_events = 0;
            } else {
                fetch.idle_events += 1;
            }

            if fetch.waiters.is_empty() && fetch.idle_events >= self.read_ahead_events {
                debug!(
                    source_id = %self.source_id,
                    frontier = %position,
                    "Relay fetch idle, closing upstream stream"
                );
                groups.fetches.remove(&id);
                return Ok(());
            }
        }
    }

    /// Fail every waiter of fetch `id`.
    async fn fail_fetch(&self, id: u64, key: Option<CanonicalPosition>, error: ReplicationError) {
        let mut groups = self.groups.lock().await;
        let Some(fetch) = groups.fetches.remove(&id) else {
            return;
        };
        drop(groups);

        metrics::record_fetch_failure(&self.source_id, error.label());
        for waiter in fetch.waiters {
            let err = match &error {
                ReplicationError::UnknownSource { .. } => ReplicationError::UnknownSource {
                    source_id: self.source_id.clone(),
                },
                ReplicationError::PositionNotAvailable { .. } if waiter.after == key => {
                    ReplicationError::PositionNotAvailable {
                        source_id: self.source_id.clone(),
                        requested: waiter.after,
                    }
                }
                other => ReplicationError::upstream_unavailable(
                    &self.source_id,
                    format!("relay fetch failed: {}", other),
                ),
            };
            let _ = waiter.tx.send(Err(err));
        }
    }
}

/// Hand `event` to every waiter it answers; drop waiters that went away.
fn release(waiters: &mut Vec<Waiter>, event: &Arc<Event>) -> usize {
    let mut released = 0;
    let mut pending = Vec::with_capacity(waiters.len());
    for waiter in waiters.drain(..) {
        if waiter.tx.is_closed() {
            continue;
        }
        if is_after(event.position, waiter.after) {
            if waiter.tx.send(Ok(event.clone())).is_ok() {
                released += 1;
            }
        } else {
            pending.push(waiter);
        }
    }
    *waiters = pending;
    released
}
