// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The Server role: authoritative source of named event streams.
//!
//! Each configured source is backed by an [`EventSource`]. A stream session
//! gets its own producer task that pages through the log and, once caught
//! up, parks on the source's head notification until something new is
//! appended. Nothing polls on a timer.
//!
//! # Session lifecycle
//!
//! ```text
//! connect(source)        -> Session        (UnknownSource if not configured)
//! stream_from(session,p) -> EventStream    (PositionNotAvailable if p is
//!                                           below retention or past head)
//!   producer: read_after(cursor) ─► send ─► ... ─► caught up ─► await head
//!   ends when the EventStream is dropped (downstream disconnected)
//! ```
//!
//! The Server never mutates replication state; it only reads its sources.

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{ReplicationError, Result};
use crate::event::{EventSender, EventStream};
use crate::listener;
use crate::metrics;
use crate::position::{display_after, CanonicalPosition};
use crate::source::{check_available, BoxFuture, EventSource, SqliteEventLog};
use crate::upstream::{Session, Upstream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};

/// Serves one or more sources to Clients and Relays.
pub struct Server {
    name: String,
    sources: HashMap<String, Arc<dyn EventSource>>,
    session: SessionConfig,
}

impl Server {
    /// Create a server with no sources.
    pub fn new(session: SessionConfig) -> Self {
        Self {
            name: "server".to_string(),
            sources: HashMap::new(),
            session,
        }
    }

    /// Build a server from configuration, opening each source's event log.
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut server = Self::new(config.session.clone()).with_name(config.listen_addr.clone());
        for source in &config.sources {
            let log = SqliteEventLog::open(&source.source_id, &source.event_log_path).await?;
            server.add_source(Arc::new(log))?;
        }
        Ok(server)
    }

    /// Name used in logs and as this upstream's endpoint.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a source (builder style).
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Result<Self> {
        self.add_source(source)?;
        Ok(self)
    }

    /// Register a source. Source IDs must be unique.
    pub fn add_source(&mut self, source: Arc<dyn EventSource>) -> Result<()> {
        let id = source.source_id().to_string();
        if self.sources.contains_key(&id) {
            return Err(ReplicationError::Config(format!("duplicate source {}", id)));
        }
        info!(server = %self.name, source_id = %id, "Registered source");
        self.sources.insert(id, source);
        Ok(())
    }

    /// Configured source IDs.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a session for `source_id`.
    pub fn connect(&self, source_id: &str) -> Result<Session> {
        if self.sources.contains_key(source_id) {
            Ok(Session::new(source_id))
        } else {
            Err(ReplicationError::UnknownSource {
                source_id: source_id.to_string(),
            })
        }
    }

    /// Stream every event after `after` for the session's source.
    ///
    /// The returned stream is infinite in principle; it only ends when the
    /// receiver is dropped or the source fails.
    pub async fn stream_from(
        &self,
        session: &mut Session,
        after: Option<CanonicalPosition>,
    ) -> Result<EventStream> {
        let source = self
            .sources
            .get(&session.source_id)
            .cloned()
            .ok_or_else(|| ReplicationError::UnknownSource {
                source_id: session.source_id.clone(),
            })?;

        // Subscribe before checking the head so no append slips between
        let head_rx = source.subscribe();
        let floor = source.retention_floor().await?;
        let head = source.latest_position().await?;
        check_available(&session.source_id, after, floor, head)?;

        session.requested = after;
        session.last_sent = None;

        let (tx, events) = EventStream::channel(self.session.stream_buffer);
        let span = info_span!("server_session", source_id = %session.source_id);
        let batch = self.session.read_batch_size.max(1);
        debug!(
            source_id = %session.source_id,
            after = %display_after(after),
            "Starting server stream"
        );
        tokio::spawn(produce(source, head_rx, tx, after, batch).instrument(span));

        Ok(events)
    }

    /// Serve the wire protocol on `listener` until `shutdown` flips to true.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        let session = self.session.clone();
        listener::serve(self, listener, &session, shutdown).await
    }
}

/// Producer task for one session.
async fn produce(
    source: Arc<dyn EventSource>,
    mut head_rx: watch::Receiver<Option<CanonicalPosition>>,
    tx: EventSender,
    mut cursor: Option<CanonicalPosition>,
    batch: usize,
) {
    let source_id = source.source_id().to_string();
    loop {
        // Mark the current head seen before reading so a later append wakes us
        let _ = head_rx.borrow_and_update();

        let events = match source.read_after(cursor, batch).await {
            Ok(events) => events,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        if events.is_empty() {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(source_id = %source_id, "Downstream closed, ending session");
                    return;
                }
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        let _ = tx
                            .send(Err(ReplicationError::upstream_unavailable(
                                &source_id,
                                "event source closed",
                            )))
                            .await;
                        return;
                    }
                }
            }
            continue;
        }

        let count = events.len();
        for event in events {
            let position = event.position;
            if tx.send(Ok(event)).await.is_err() {
                debug!(source_id = %source_id, "Downstream closed, ending session");
                return;
            }
            cursor = Some(position);
        }
        metrics::record_events_served("server", &source_id, count);
    }
}

impl Upstream for Server {
    fn endpoint(&self) -> &str {
        &self.name
    }

    fn open<'a>(&'a self, source_id: &'a str, after: Option<CanonicalPosition>) -> BoxFuture<'a, EventStream> {
        Box::pin(async move {
            let mut session = self.connect(source_id)?;
            self.stream_from(&mut session, after).await
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("sources", &self.source_ids())
            .finish()
    }
}
