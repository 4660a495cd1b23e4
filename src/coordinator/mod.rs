// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! Runs the Client role for a node: one [`ReplicationClient`] task per
//! configured source, all sharing one [`PositionStore`] and applier.
//!
//! # Architecture
//!
//! 1. Opens the position store (SQLite)
//! 2. Resolves each source's upstream (a configured TCP address, or an
//!    in-process [`Upstream`] registered with [`ReplicationEngine::with_upstream`])
//! 3. Spawns a Client per source; a Client that halts only stops its source
//! 4. On shutdown, signals every Client, waits for in-flight applies, then
//!    checkpoints and closes the store

mod types;

pub use types::{EngineState, HealthCheck, SourceHealth};

use crate::applier::Applier;
use crate::client::{ClientState, ReplicationClient};
use crate::config::ClientConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::position_store::PositionStore;
use crate::resilience::RateLimiter;
use crate::upstream::{RemoteUpstream, Upstream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ClientTask {
    client: Arc<ReplicationClient>,
    upstream: String,
    halted_reason: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

/// The Client-role engine for one node.
pub struct ReplicationEngine {
    config: ClientConfig,

    applier: Arc<dyn Applier>,

    /// In-process upstreams that replace a source's configured address
    upstreams: HashMap<String, Arc<dyn Upstream>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Opened on start unless one was supplied
    store: Option<Arc<PositionStore>>,

    clients: Vec<ClientTask>,

    shutdown_tx: watch::Sender<bool>,
}

impl ReplicationEngine {
    /// Create an engine in `Created` state.
    pub fn new(config: ClientConfig, applier: Arc<dyn Applier>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            applier,
            upstreams: HashMap::new(),
            state_tx,
            store: None,
            clients: Vec::new(),
            shutdown_tx,
        }
    }

    /// Pull `source_id` from `upstream` instead of its configured address.
    pub fn with_upstream(mut self, source_id: impl Into<String>, upstream: Arc<dyn Upstream>) -> Self {
        self.upstreams.insert(source_id.into(), upstream);
        self
    }

    /// Use an already-open store instead of opening `config.position_store`.
    pub fn with_position_store(mut self, store: Arc<PositionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch engine state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The store, once started (or supplied).
    pub fn position_store(&self) -> Option<&Arc<PositionStore>> {
        self.store.as_ref()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Open the store and spawn one Client per configured source.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        for source_id in self.upstreams.keys() {
            if !self.config.sources.iter().any(|s| &s.source_id == source_id) {
                warn!(source_id = %source_id, "Upstream override for unconfigured source ignored");
            }
        }

        info!(source_count = self.config.sources.len(), "Starting replication engine");

        let store = match &self.store {
            Some(store) => store.clone(),
            None => match PositionStore::open(&self.config.position_store).await {
                Ok(store) => {
                    info!(path = %self.config.position_store.sqlite_path, "Position store initialized");
                    let store = Arc::new(store);
                    self.store = Some(store.clone());
                    store
                }
                Err(e) => {
                    self.set_state(EngineState::Failed);
                    return Err(e);
                }
            },
        };

        let rate_limiter = self.config.rate_limit.clone().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for applies"
            );
            Arc::new(RateLimiter::new(cfg))
        });
        let retry = self.config.retry_config();
        let startup_retry = self.config.startup_retry_config();

        for source in &self.config.sources {
            let upstream: Arc<dyn Upstream> = match self.upstreams.get(&source.source_id) {
                Some(upstream) => upstream.clone(),
                None => Arc::new(
                    RemoteUpstream::new(&source.upstream_addr).with_connect_timeout(retry.connection_timeout),
                ),
            };

            let endpoint = upstream.endpoint().to_string();
            let mut client = ReplicationClient::new(
                source.source_id.clone(),
                upstream,
                store.clone(),
                self.applier.clone(),
            )
            .with_retry(retry.clone());
            if let Some(startup) = &startup_retry {
                client = client.with_startup_retry(startup.clone());
            }
            if let Some(limiter) = &rate_limiter {
                client = client.with_rate_limiter(limiter.clone());
            }
            let client = Arc::new(client);

            let halted_reason = Arc::new(Mutex::new(None));
            let handle = tokio::spawn({
                let client = client.clone();
                let halted_reason = halted_reason.clone();
                let shutdown_rx = self.shutdown_tx.subscribe();
                async move {
                    if let Err(e) = client.run(shutdown_rx).await {
                        *halted_reason.lock().await = Some(e.to_string());
                    }
                }
            });

            debug!(source_id = %source.source_id, "Spawned replication client");
            self.clients.push(ClientTask {
                client,
                upstream: endpoint,
                halted_reason,
                handle: Some(handle),
            });
        }

        metrics::set_running_clients(self.clients.len());
        self.set_state(EngineState::Running);
        info!(sources = self.clients.len(), "Replication engine running");
        Ok(())
    }

    /// Health snapshot for monitoring endpoints.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let mut sources = Vec::with_capacity(self.clients.len());

        for task in &self.clients {
            let client = &task.client;
            let position = match &self.store {
                Some(store) => store.get(client.source_id()).await.unwrap_or_else(|e| {
                    warn!(source_id = %client.source_id(), error = %e, "Could not read position for health check");
                    None
                }),
                None => None,
            };

            sources.push(SourceHealth {
                source_id: client.source_id().to_string(),
                upstream: task.upstream.clone(),
                state: client.state(),
                position,
                applied: client.applied(),
                reconnects: client.reconnects(),
                halted_reason: task.halted_reason.lock().await.clone(),
            });
        }

        let sources_total = sources.len();
        let sources_streaming = sources
            .iter()
            .filter(|s| matches!(s.state, ClientState::Streaming | ClientState::Applying))
            .count();
        let sources_halted = sources.iter().filter(|s| s.state == ClientState::Halted).count();
        let running = sources.iter().filter(|s| !s.state.is_terminal()).count();
        metrics::set_running_clients(running);

        let ready = state == EngineState::Running && running > 0;
        let healthy = ready && sources_halted == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            sources_total,
            sources_streaming,
            sources_halted,
            sources,
        }
    }

    fn client(&self, source_id: &str) -> Option<&Arc<ReplicationClient>> {
        self.clients
            .iter()
            .map(|task| &task.client)
            .find(|client| client.source_id() == source_id)
    }

    /// Current state of a source's Client (`None` if not running it).
    pub fn source_state(&self, source_id: &str) -> Option<ClientState> {
        self.client(source_id).map(|client| client.state())
    }

    /// Wait until a source's Client reaches `target`.
    pub async fn wait_for_state(&self, source_id: &str, target: ClientState, within: Duration) -> Result<()> {
        let client = self.client(source_id).ok_or_else(|| ReplicationError::UnknownSource {
            source_id: source_id.to_string(),
        })?;
        let mut rx = client.subscribe();

        // Release the watch::Ref before `rx` goes out of scope
        let reached = tokio::time::timeout(within, rx.wait_for(|state| *state == target))
            .await
            .map(|waited| waited.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReplicationError::Shutdown),
            Err(_) => Err(ReplicationError::InvalidState {
                expected: target.to_string(),
                actual: client.state().to_string(),
            }),
        }
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal every Client
    /// 2. Wait (bounded by `shutdown_timeout`) for in-flight applies to commit
    /// 3. Checkpoint and close the position store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let drain_timeout = self.config.shutdown_timeout();
        for task in &mut self.clients {
            let Some(handle) = task.handle.take() else {
                continue;
            };
            let source_id = task.client.source_id().to_string();
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(source_id = %source_id, "Client stopped"),
                Ok(Err(e)) => warn!(source_id = %source_id, error = %e, "Client task panicked"),
                Err(_) => warn!(source_id = %source_id, "Client did not stop within shutdown timeout"),
            }
        }
        metrics::set_running_clients(0);

        if let Some(store) = &self.store {
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}
