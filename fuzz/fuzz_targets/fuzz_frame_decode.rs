// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for wire frame decoding.
//!
//! The first byte is the frame tag, the rest the body. Decoding (including
//! zstd decompression of EVENT payloads) must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_replication::protocol::decode_frame;

fuzz_target!(|data: &[u8]| {
    if let Some((&tag, body)) = data.split_first() {
        let _ = decode_frame(tag, body);
    }
});
