// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event sources consumed by the Server.
//!
//! An [`EventSource`] is the opaque ordered log of one source. The Server
//! only ever reads from it: pages of events strictly after a position, the
//! current head, and a head-change notification used to park a caught-up
//! session until something new is appended (no polling timer).
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryEventLog`]: in-process log, handy for tests and embedding.
//! - [`SqliteEventLog`]: durable log in a SQLite file.
//!
//! # Retention
//!
//! Both logs support `purge_through(p)`, which drops every event at or
//! before `p` and records `p` as the retention floor. A request for events
//! after a position below the floor can no longer be served without a gap
//! and is refused with `PositionNotAvailable`.

mod memory;
mod sqlite;

pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;

use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::position::CanonicalPosition;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

/// Boxed future type for the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ordered, read-only view of one source's event log.
pub trait EventSource: Send + Sync + 'static {
    /// Source this log belongs to.
    fn source_id(&self) -> &str;

    /// Up to `limit` events with position strictly after `after`, ascending.
    ///
    /// Fails with `PositionNotAvailable` if `after` predates the retention
    /// floor.
    fn read_after<'a>(
        &'a self,
        after: Option<CanonicalPosition>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Event>>;

    /// Position of the newest event, never below the retention floor.
    /// `None` only for a log that has never held an event.
    fn latest_position(&self) -> BoxFuture<'_, Option<CanonicalPosition>>;

    /// Highest purged position, `None` if nothing was ever purged.
    fn retention_floor(&self) -> BoxFuture<'_, Option<CanonicalPosition>>;

    /// Receiver that changes whenever the head advances.
    fn subscribe(&self) -> watch::Receiver<Option<CanonicalPosition>>;
}

/// Check that a stream starting after `after` can be served gap-free.
///
/// Refuses a resume point below the retention floor (the next event it
/// needs is gone) and one beyond the head (the requester has seen events
/// this log never had).
pub fn check_available(
    source_id: &str,
    after: Option<CanonicalPosition>,
    floor: Option<CanonicalPosition>,
    head: Option<CanonicalPosition>,
) -> Result<()> {
    let not_available = || ReplicationError::PositionNotAvailable {
        source_id: source_id.to_string(),
        requested: after,
    };

    if let Some(floor) = floor {
        match after {
            None => return Err(not_available()),
            Some(a) if a < floor => return Err(not_available()),
            _ => {}
        }
    }

    match (after, head) {
        (Some(a), Some(h)) if a > h => Err(not_available()),
        (Some(_), None) => Err(not_available()),
        _ => Ok(()),
    }
}

/// Reject an append that would not extend the log.
pub(crate) fn check_append(
    source_id: &str,
    head: Option<CanonicalPosition>,
    position: CanonicalPosition,
) -> Result<()> {
    match head {
        Some(h) if position <= h => Err(ReplicationError::Internal(format!(
            "append to {} at {} does not follow head {}",
            source_id, position, h
        ))),
        _ => Ok(()),
    }
}
