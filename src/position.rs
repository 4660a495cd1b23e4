// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical (root-relative) positions.
//!
//! A [`CanonicalPosition`] names a point in the root Server's event stream as
//! `(log_file_index, offset)`. Positions are assigned once by the root and are
//! passed through every relay hop untouched, so a Client can switch between
//! any Server or Relay serving the same source without translating its
//! saved position.
//!
//! Ordering is lexicographic: the log file index dominates, the offset breaks
//! ties. Stream requests carry `Option<CanonicalPosition>` meaning "events
//! strictly after this position", with `None` meaning the beginning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in the root-relative event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalPosition {
    /// Index of the transaction log file on the root server.
    pub log_file_index: u64,
    /// Offset within that log file.
    pub offset: u64,
}

impl CanonicalPosition {
    pub const fn new(log_file_index: u64, offset: u64) -> Self {
        Self {
            log_file_index,
            offset,
        }
    }
}

impl fmt::Display for CanonicalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file_index, self.offset)
    }
}

/// Error parsing a position from its `file:offset` text form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid position {input:?}: expected <log_file_index>:<offset>")]
pub struct ParsePositionError {
    pub input: String,
}

impl FromStr for CanonicalPosition {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePositionError {
            input: s.to_string(),
        };
        let (file, offset) = s.split_once(':').ok_or_else(err)?;
        let log_file_index = file.trim().parse().map_err(|_| err())?;
        let offset = offset.trim().parse().map_err(|_| err())?;
        Ok(Self::new(log_file_index, offset))
    }
}

/// Format an optional resume point for logs (`None` is the beginning).
pub fn display_after(after: Option<CanonicalPosition>) -> String {
    match after {
        Some(p) => p.to_string(),
        None => "beginning".to_string(),
    }
}

/// Whether `position` is strictly after the resume point `after`.
pub fn is_after(position: CanonicalPosition, after: Option<CanonicalPosition>) -> bool {
    match after {
        Some(a) => position > a,
        None => true,
    }
}
