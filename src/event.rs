// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated events and the stream type every hop hands out.

use crate::error::{ReplicationError, Result};
use crate::position::CanonicalPosition;
use tokio::sync::mpsc;

/// One replicated unit of work, immutable once emitted by the root Server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Source stream this event belongs to.
    pub source_id: String,
    /// Root-assigned position; never rewritten by relays.
    pub position: CanonicalPosition,
    /// Opaque serialized operation.
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(source_id: impl Into<String>, position: CanonicalPosition, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source_id: source_id.into(),
            position,
            payload: payload.into(),
        }
    }

    /// Resume point to request once this event has been applied.
    pub fn resume_after(&self) -> Option<CanonicalPosition> {
        Some(self.position)
    }
}

/// Receive side of a per-session event stream.
///
/// Backed by a bounded channel: a consumer that stops reading blocks the
/// producer for this session only. Dropping the stream closes the channel,
/// which the producer observes and uses to end its session.
///
/// An `Err` item is terminal; no further items follow it.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event>>,
}

/// Send side of an [`EventStream`].
pub type EventSender = mpsc::Sender<Result<Event>>;

impl EventStream {
    /// Create a bounded stream with its sender.
    pub fn channel(buffer: usize) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }

    /// A stream that yields a single error and ends.
    pub fn failed(err: ReplicationError) -> Self {
        let (tx, stream) = Self::channel(1);
        // Capacity 1 and nothing queued yet
        let _ = tx.try_send(Err(err));
        stream
    }

    /// Receive the next item; `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_after_is_own_position() {
        let ev = Event::new("db1", CanonicalPosition::new(1, 10), b"x".to_vec());
        assert_eq!(ev.resume_after(), Some(CanonicalPosition::new(1, 10)));
    }

    #[tokio::test]
    async fn test_failed_stream_yields_error_then_ends() {
        let mut stream = EventStream::failed(ReplicationError::Shutdown);
        assert!(matches!(stream.next().await, Some(Err(ReplicationError::Shutdown))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_sender() {
        let (tx, stream) = EventStream::channel(4);
        drop(stream);
        tx.closed().await;
        assert!(tx.is_closed());
    }
}
