// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The Client role: one replication loop per (source, local store) pair.
//!
//! ```text
//!          ┌──────────────── retryable failure (backoff) ───────────────┐
//!          ▼                                                            │
//! Disconnected ─► Connecting ─► Streaming ─► Applying ─► Streaming ─► ...
//!                                              │
//!                                              └─ conflict / position /
//!                                                 protocol error ─► Halted
//! ```
//!
//! Every session starts by reading the durable position from the
//! [`PositionStore`] and asking the upstream for events strictly after it.
//! Each event is applied and checkpointed in one transaction, so the resume
//! point is always exactly the last event whose effects are committed.
//!
//! # Graceful Shutdown
//!
//! Shutdown is observed between events. An apply that has started runs to
//! its commit (or rollback); nothing is left half-applied.

use crate::applier::Applier;
use crate::error::{ReplicationError, Result};
use crate::event::EventStream;
use crate::listener::shutdown_signalled;
use crate::metrics;
use crate::position::{display_after, is_after, CanonicalPosition};
use crate::position_store::{CheckpointOutcome, PositionStore};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::upstream::Upstream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Lifecycle state of one Client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected (initial, and after any retryable failure).
    Disconnected,
    /// Opening the upstream stream.
    Connecting,
    /// Waiting for the next event.
    Streaming,
    /// Applying an event and checkpointing its position.
    Applying,
    /// Stopped on a fatal error; needs an operator.
    Halted,
    /// Stopped by shutdown.
    Stopped,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Applying => "applying",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the client has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Halted | Self::Stopped)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum SessionEnd {
    Shutdown,
    Failed(ReplicationError),
}

/// Replicates one source from an upstream into the local store.
pub struct ReplicationClient {
    source_id: String,
    upstream: Arc<dyn Upstream>,
    store: Arc<PositionStore>,
    applier: Arc<dyn Applier>,
    retry: RetryConfig,
    startup_retry: Option<RetryConfig>,
    /// Set once an upstream open has succeeded
    connected: AtomicBool,
    rate_limiter: Option<Arc<RateLimiter>>,
    state_tx: watch::Sender<ClientState>,
    applied: AtomicU64,
    skipped: AtomicU64,
    reconnects: AtomicU64,
}

impl ReplicationClient {
    pub fn new(
        source_id: impl Into<String>,
        upstream: Arc<dyn Upstream>,
        store: Arc<PositionStore>,
        applier: Arc<dyn Applier>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        Self {
            source_id: source_id.into(),
            upstream,
            store,
            applier,
            retry: RetryConfig::daemon(),
            startup_retry: None,
            connected: AtomicBool::new(false),
            rate_limiter: None,
            state_tx,
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Retry schedule used until the first successful open.
    pub fn with_startup_retry(mut self, retry: RetryConfig) -> Self {
        self.startup_retry = Some(retry);
        self
    }

    /// Schedule in force: the startup one until the upstream first answers.
    fn retry_policy(&self) -> &RetryConfig {
        match &self.startup_retry {
            Some(startup) if !self.connected.load(Ordering::Relaxed) => startup,
            _ => &self.retry,
        }
    }

    /// Throttle applies (one token per event).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Events applied by this instance.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Events skipped because the store was already past them.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Reconnects after retryable failures.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Durable resume position.
    pub async fn position(&self) -> Result<Option<CanonicalPosition>> {
        self.store.get(&self.source_id).await
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            metrics::record_client_state(&self.source_id, state.as_str());
        }
    }

    /// Run until shutdown (`Ok`) or a fatal error (`Err`, state `Halted`).
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("client", source_id = %self.source_id);
        async move {
            info!(upstream = %self.upstream.endpoint(), "Starting replication client");
            let mut attempt = 0usize;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let failure = match self.session(&mut shutdown_rx, &mut attempt).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Failed(e) => e,
                };

                if !failure.is_retryable() {
                    return Err(self.halt(failure));
                }

                attempt += 1;
                let retry = self.retry_policy();
                if attempt >= retry.max_attempts {
                    error!(attempt, error = %failure, "Giving up after max retries");
                    return Err(self.halt(failure));
                }

                self.set_state(ClientState::Disconnected);
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::record_reconnect(&self.source_id, failure.label());

                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %failure,
                    "Upstream failure, retrying"
                );

                tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut shutdown_rx) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ClientState::Stopped);
            info!(applied = self.applied(), "Replication client stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn halt(&self, e: ReplicationError) -> ReplicationError {
        self.set_state(ClientState::Halted);
        metrics::record_halt(&self.source_id, e.label());
        if e.is_conflict() {
            error!(error = %e, "Replication conflict, source halted until resolved");
        } else {
            error!(error = %e, "Replication halted");
        }
        e
    }

    async fn open(&self, after: Option<CanonicalPosition>) -> Result<EventStream> {
        let connection_timeout = self.retry_policy().connection_timeout;
        let opened = match timeout(connection_timeout, self.upstream.open(&self.source_id, after)).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::transport(
                self.upstream.endpoint(),
                format!("open timed out after {}ms", connection_timeout.as_millis()),
            )),
        };
        if opened.is_ok() {
            self.connected.store(true, Ordering::Relaxed);
        }
        opened
    }

    async fn session(&self, shutdown_rx: &mut watch::Receiver<bool>, attempt: &mut usize) -> SessionEnd {
        self.set_state(ClientState::Connecting);

        let resume = match self.store.get(&self.source_id).await {
            Ok(position) => position,
            Err(e) => return SessionEnd::Failed(e),
        };
        info!(after = %display_after(resume), "Resuming from saved position");

        let mut stream = tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown_rx) => return SessionEnd::Shutdown,
            opened = self.open(resume) => match opened {
                Ok(stream) => stream,
                Err(e) => return SessionEnd::Failed(e),
            },
        };
        self.set_state(ClientState::Streaming);

        let mut last = resume;
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown_rx) => return SessionEnd::Shutdown,
                item = stream.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => {
                    return SessionEnd::Failed(ReplicationError::upstream_unavailable(
                        &self.source_id,
                        "upstream closed the stream",
                    ))
                }
            };

            if !is_after(event.position, last) {
                return SessionEnd::Failed(ReplicationError::Protocol(format!(
                    "{}: upstream sent {} after {}",
                    self.source_id,
                    event.position,
                    display_after(last)
                )));
            }

            // Progress resets the backoff schedule
            *attempt = 0;

            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            self.set_state(ClientState::Applying);
            let started = Instant::now();
            match self
                .store
                .apply_and_checkpoint(&self.source_id, &event, self.applier.as_ref())
                .await
            {
                Ok(CheckpointOutcome::Applied) => {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_applied(&self.source_id, started.elapsed());
                    debug!(position = %event.position, "Applied event");
                }
                Ok(CheckpointOutcome::AlreadyApplied) => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_event_skipped(&self.source_id);
                }
                Err(e) => return SessionEnd::Failed(e),
            }

            last = Some(event.position);
            self.set_state(ClientState::Streaming);
        }
    }
}

impl std::fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("source_id", &self.source_id)
            .field("upstream", &self.upstream.endpoint())
            .field("state", &self.state())
            .finish()
    }
}
