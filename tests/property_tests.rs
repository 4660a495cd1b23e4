// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use mesh_replication::position::is_after;
use mesh_replication::protocol::{decode_frame, Frame, FrameCodec};
use mesh_replication::relay::cache::SourceCache;
use mesh_replication::resilience::RetryConfig;
use mesh_replication::{CanonicalPosition, Event};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn position() -> impl Strategy<Value = CanonicalPosition> {
    (0u64..8, 0u64..1_000).prop_map(|(f, o)| CanonicalPosition::new(f, o))
}

fn ascending_run() -> impl Strategy<Value = Vec<CanonicalPosition>> {
    prop::collection::btree_set(position(), 1..40).prop_map(|set| set.into_iter().collect())
}

// =============================================================================
// Position Ordering Properties
// =============================================================================

proptest! {
    /// Ordering is lexicographic on (log_file_index, offset)
    #[test]
    fn position_order_is_lexicographic(a in position(), b in position()) {
        let expected = (a.log_file_index, a.offset).cmp(&(b.log_file_index, b.offset));
        prop_assert_eq!(a.cmp(&b), expected);
    }

    /// A higher file index always wins, whatever the offsets
    #[test]
    fn file_index_dominates_offset(f in 0u64..1_000, o1 in any::<u64>(), o2 in any::<u64>()) {
        prop_assert!(CanonicalPosition::new(f, o1) < CanonicalPosition::new(f + 1, o2));
    }

    /// `is_after` agrees with the ordering, and everything is after the beginning
    #[test]
    fn is_after_matches_ordering(a in position(), b in position()) {
        prop_assert_eq!(is_after(a, Some(b)), a > b);
        prop_assert!(is_after(a, None));
    }

    /// Text form parses back to the same position
    #[test]
    fn position_text_form_parses(f in any::<u64>(), o in any::<u64>()) {
        let pos = CanonicalPosition::new(f, o);
        prop_assert_eq!(pos.to_string().parse::<CanonicalPosition>().unwrap(), pos);
    }

    /// Arbitrary text never panics the parser
    #[test]
    fn position_parse_no_panic(s in ".{0,40}") {
        let _ = s.parse::<CanonicalPosition>();
    }
}

// =============================================================================
// Relay Cache Properties
// =============================================================================

proptest! {
    /// Walking a cached contiguous run from its start yields exactly the run
    #[test]
    fn cache_walk_reproduces_contiguous_run(run in ascending_run()) {
        let mut cache = SourceCache::new(1_000, None);
        let mut prev = None;
        for &pos in &run {
            cache.insert(Arc::new(Event::new("db1", pos, Vec::new())), prev);
            prev = Some(pos);
        }

        let mut walked = Vec::new();
        let mut cursor = None;
        while let Some(event) = cache.lookup_after(cursor) {
            walked.push(event.position);
            cursor = Some(event.position);
        }
        prop_assert_eq!(walked, run);
    }

    /// A hit is only served when no uncached event could sit in between
    #[test]
    fn cache_never_skips_a_gap(run in ascending_run(), query in position()) {
        // Cache the run as fetched from its first element onward
        let mut cache = SourceCache::new(1_000, None);
        let start = run[0];
        let mut prev = Some(start);
        for &pos in &run[1..] {
            cache.insert(Arc::new(Event::new("db1", pos, Vec::new())), prev);
            prev = Some(pos);
        }

        match cache.lookup_after(Some(query)) {
            Some(event) => {
                // Served events follow the query, and the query is inside the fetched range
                prop_assert!(event.position > query);
                prop_assert!(query >= start);
                let skipped: BTreeSet<_> = run.iter().filter(|p| **p > query && **p < event.position).collect();
                prop_assert!(skipped.is_empty(), "skipped {:?}", skipped);
            }
            None => {
                let next_in_run = run[1..].iter().find(|p| **p > query);
                prop_assert!(query < start || next_in_run.is_none());
            }
        }
    }

    /// The cache never holds more than its capacity
    #[test]
    fn cache_respects_capacity(run in ascending_run(), capacity in 1usize..10) {
        let mut cache = SourceCache::new(capacity, None);
        let mut prev = None;
        let mut evicted = 0;
        for &pos in &run {
            evicted += cache.insert(Arc::new(Event::new("db1", pos, Vec::new())), prev);
            prev = Some(pos);
            prop_assert!(cache.len() <= capacity);
        }
        prop_assert_eq!(cache.len() + evicted, run.len());
    }
}

// =============================================================================
// Wire Frame Properties
// =============================================================================

proptest! {
    /// Decoding arbitrary bytes never panics
    #[test]
    fn decode_frame_no_panic(tag in any::<u8>(), body in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_frame(tag, &body);
    }

    /// Event frames carry position and payload verbatim, compressed or not
    #[test]
    fn event_frame_preserves_payload(
        pos in position(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        threshold in prop::option::of(0usize..1024),
    ) {
        let codec = FrameCodec::new(threshold);
        let frame = Frame::Event { position: pos, payload: payload.clone() };
        let bytes = codec.encode(&frame).unwrap();

        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        prop_assert_eq!(len, bytes.len() - 5);
        prop_assert_eq!(decode_frame(bytes[0], &bytes[5..]).unwrap(), frame);
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Backoff never exceeds the ceiling and never shrinks as attempts grow
    #[test]
    fn backoff_bounded_and_monotonic(
        initial_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..10.0,
        attempt in 0usize..10_000,
    ) {
        let config = RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            backoff_factor: factor,
            connection_timeout: Duration::from_secs(1),
        };
        let here = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(here <= config.max_delay);
        prop_assert!(next >= here);
    }
}
