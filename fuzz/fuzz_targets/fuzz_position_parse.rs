// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for position parsing.
//!
//! Any string that parses must print back to a string that parses to the
//! same position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_replication::CanonicalPosition;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(pos) = s.parse::<CanonicalPosition>() {
            let again: CanonicalPosition = pos.to_string().parse().expect("display form must parse");
            assert_eq!(pos, again);
        }
    }
});
