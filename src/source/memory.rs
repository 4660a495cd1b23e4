// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory event log.

use super::{check_append, BoxFuture, EventSource};
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::position::CanonicalPosition;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::{watch, RwLock};
use tracing::debug;

#[derive(Default)]
struct LogState {
    events: BTreeMap<CanonicalPosition, Vec<u8>>,
    head: Option<CanonicalPosition>,
    floor: Option<CanonicalPosition>,
}

/// Event log held entirely in memory.
pub struct MemoryEventLog {
    source_id: String,
    state: RwLock<LogState>,
    head_tx: watch::Sender<Option<CanonicalPosition>>,
}

impl MemoryEventLog {
    pub fn new(source_id: impl Into<String>) -> Self {
        let (head_tx, _) = watch::channel(None);
        Self {
            source_id: source_id.into(),
            state: RwLock::new(LogState::default()),
            head_tx,
        }
    }

    /// Build a log pre-populated with `events` (must be strictly ascending).
    pub async fn with_events<I, P>(source_id: impl Into<String>, events: I) -> Result<Self>
    where
        I: IntoIterator<Item = (CanonicalPosition, P)>,
        P: Into<Vec<u8>>,
    {
        let log = Self::new(source_id);
        for (position, payload) in events {
            log.append(position, payload).await?;
        }
        Ok(log)
    }

    /// Append an event and wake any session waiting on the head.
    pub async fn append(&self, position: CanonicalPosition, payload: impl Into<Vec<u8>>) -> Result<()> {
        let mut state = self.state.write().await;
        check_append(&self.source_id, state.head, position)?;
        state.events.insert(position, payload.into());
        state.head = Some(position);
        drop(state);

        self.head_tx.send_replace(Some(position));
        debug!(source_id = %self.source_id, position = %position, "Event appended");
        Ok(())
    }

    /// Drop every event at or before `through`. The head never falls below
    /// the retention floor.
    pub async fn purge_through(&self, through: CanonicalPosition) -> usize {
        let mut state = self.state.write().await;
        let kept = state.events.split_off(&next_key(through));
        let purged = std::mem::replace(&mut state.events, kept).len();
        state.floor = Some(state.floor.map_or(through, |f| f.max(through)));
        let raised = state.floor > state.head;
        if raised {
            state.head = state.floor;
        }
        let head = state.head;
        drop(state);

        if raised {
            self.head_tx.send_replace(head);
        }
        debug!(source_id = %self.source_id, through = %through, purged, "Purged event log");
        purged
    }

    /// Number of retained events.
    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.events.is_empty()
    }
}

/// Smallest key strictly greater than `p` for `split_off`.
fn next_key(p: CanonicalPosition) -> CanonicalPosition {
    match p.offset.checked_add(1) {
        Some(offset) => CanonicalPosition::new(p.log_file_index, offset),
        None => CanonicalPosition::new(p.log_file_index.saturating_add(1), 0),
    }
}

impl EventSource for MemoryEventLog {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn read_after<'a>(
        &'a self,
        after: Option<CanonicalPosition>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Event>> {
        Box::pin(async move {
            let state = self.state.read().await;
            if let Some(floor) = state.floor {
                if after.map_or(true, |a| a < floor) {
                    return Err(ReplicationError::PositionNotAvailable {
                        source_id: self.source_id.clone(),
                        requested: after,
                    });
                }
            }

            let lower = match after {
                Some(a) => Bound::Excluded(a),
                None => Bound::Unbounded,
            };
            Ok(state
                .events
                .range((lower, Bound::Unbounded))
                .take(limit)
                .map(|(pos, payload)| Event::new(self.source_id.clone(), *pos, payload.clone()))
                .collect())
        })
    }

    fn latest_position(&self) -> BoxFuture<'_, Option<CanonicalPosition>> {
        Box::pin(async move { Ok(self.state.read().await.head) })
    }

    fn retention_floor(&self) -> BoxFuture<'_, Option<CanonicalPosition>> {
        Box::pin(async move { Ok(self.state.read().await.floor) })
    }

    fn subscribe(&self) -> watch::Receiver<Option<CanonicalPosition>> {
        self.head_tx.subscribe()
    }
}

impl std::fmt::Debug for MemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventLog")
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}
