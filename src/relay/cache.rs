// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay event cache.
//!
//! Entries are keyed by canonical position and remember the position that
//! preceded them in the upstream stream they were fetched from (`prev`,
//! `None` when the fetch started from the beginning). That link is what
//! makes a hit safe: the first cached event after `P` is only served when
//! its `prev <= P`, which proves no event exists between `P` and it.
//!
//! ```text
//! cached:   (0,100)◄─prev─(0,250)◄─prev─(1,10)
//! after (0,100) -> (0,250) hit     prev (0,100) <= (0,100)
//! after (0,200) -> (0,250) hit     prev (0,100) <= (0,200)
//! after (0,50)  -> (0,100) hit iff (0,100).prev <= (0,50)
//! ```
//!
//! Eviction is by insertion order (oldest first) once a source exceeds its
//! capacity, plus an optional maximum entry age. Waiters of an in-flight
//! fetch are handed the event directly, so evicting it never strands them.

use crate::event::Event;
use crate::position::CanonicalPosition;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    event: Arc<Event>,
    prev: Option<CanonicalPosition>,
    inserted_at: Instant,
    seq: u64,
}

/// Cached events of one source.
#[derive(Debug)]
pub struct SourceCache {
    entries: BTreeMap<CanonicalPosition, CacheEntry>,
    /// Insertion sequence -> position, oldest first
    order: BTreeMap<u64, CanonicalPosition>,
    next_seq: u64,
    capacity: usize,
    max_age: Option<Duration>,
}

impl SourceCache {
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            entries: BTreeMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            capacity,
            max_age,
        }
    }

    /// The event immediately following `after`, if the cache can prove it.
    pub fn lookup_after(&self, after: Option<CanonicalPosition>) -> Option<Arc<Event>> {
        let lower = match after {
            Some(a) => Bound::Excluded(a),
            None => Bound::Unbounded,
        };
        let (_, entry) = self.entries.range((lower, Bound::Unbounded)).next()?;

        if self.is_expired(entry, Instant::now()) {
            return None;
        }

        // None < Some(_), so a stream-start entry answers every request
        if entry.prev <= after {
            Some(entry.event.clone())
        } else {
            None
        }
    }

    /// Insert an event fetched right after `prev`. Returns entries evicted.
    pub fn insert(&mut self, event: Arc<Event>, prev: Option<CanonicalPosition>) -> usize {
        let now = Instant::now();
        let position = event.position;

        if let Some(existing) = self.entries.get_mut(&position) {
            // Two fetches saw the same event; keep the stronger contiguity link
            existing.prev = existing.prev.min(prev);
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(
                position,
                CacheEntry {
                    event,
                    prev,
                    inserted_at: now,
                    seq,
                },
            );
            self.order.insert(seq, position);
        }

        self.evict(now)
    }

    fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((&seq, &position)) = self.order.iter().next() {
            let over_capacity = self.entries.len() > self.capacity;
            let expired = self
                .entries
                .get(&position)
                .map_or(true, |entry| self.is_expired(entry, now));
            if !over_capacity && !expired {
                break;
            }
            self.order.remove(&seq);
            self.entries.remove(&position);
            evicted += 1;
        }
        evicted
    }

    /// Drop expired entries without inserting. Returns entries evicted.
    pub fn purge_expired(&mut self) -> usize {
        self.evict(Instant::now())
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        match self.max_age {
            Some(max_age) => now.duration_since(entry.inserted_at) >= max_age,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the oldest-inserted entry (next to be evicted).
    pub fn oldest(&self) -> Option<CanonicalPosition> {
        self.order.values().next().copied()
    }

    #[cfg(test)]
    fn prev_of(&self, position: CanonicalPosition) -> Option<Option<CanonicalPosition>> {
        self.entries.get(&position).map(|e| {
            debug_assert_eq!(self.order.get(&e.seq), Some(&position));
            e.prev
        })
    }
}
