// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for replication.
//!
//! Errors are categorized by how the affected role should react to them.
//! Transient failures are absorbed by retry loops; everything else is a
//! terminal state for the affected source only.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `UpstreamUnavailable` | Yes | Upstream dropped, relay fetch failed, session limit hit |
//! | `Transport` | Yes | Connection refused/reset, connect timeout |
//! | `Apply` (transient) | Yes | Local store busy/locked, apply rolled back |
//! | `UnknownSource` | No | Source not configured on the remote (config problem) |
//! | `PositionNotAvailable` | No | Requested position outside retained history |
//! | `Conflict` | No | Integrity violation at apply time (halts the source) |
//! | `Apply` (rejected) | No | Applier refused the payload for another reason |
//! | `Protocol` | No | Malformed frame or non-monotonic stream |
//! | `Decompression` | No | Corrupt compressed payload |
//! | `PositionStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | State machine violation |
//! | `Shutdown` | No | Shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a Client (or a
//! relay waiter) should back off and re-request from its durable position.

use crate::position::{CanonicalPosition, ParsePositionError};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Error kinds that can cross the wire in an `ERROR` frame.
///
/// Each one terminates the stream it is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    UnknownSource,
    PositionNotAvailable,
    UpstreamUnavailable,
}

impl WireErrorKind {
    /// Wire code for this kind.
    pub fn code(self) -> u8 {
        match self {
            Self::UnknownSource => 1,
            Self::PositionNotAvailable => 2,
            Self::UpstreamUnavailable => 3,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::UnknownSource),
            2 => Some(Self::PositionNotAvailable),
            3 => Some(Self::UpstreamUnavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSource => write!(f, "UnknownSource"),
            Self::PositionNotAvailable => write!(f, "PositionNotAvailable"),
            Self::UpstreamUnavailable => write!(f, "UpstreamUnavailable"),
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The source is not configured on the Server or Relay we asked.
    #[error("Unknown source: {source_id}")]
    UnknownSource { source_id: String },

    /// The requested position cannot be served (history truncated, or the
    /// requester is ahead of the log).
    #[error("Position not available for {source_id}: requested after {}", fmt_after(.requested))]
    PositionNotAvailable {
        source_id: String,
        requested: Option<CanonicalPosition>,
    },

    /// The upstream hop is temporarily unable to serve the stream.
    #[error("Upstream unavailable for {source_id}: {message}")]
    UpstreamUnavailable { source_id: String, message: String },

    /// Socket-level failure talking to a remote endpoint.
    #[error("Transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// Malformed frame, bad handshake, or a stream that violated ordering.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Compressed payload could not be decoded.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Applying an event violated a data invariant.
    ///
    /// Replication for the source halts until an operator resolves it.
    #[error("Replication conflict on {source_id} at {position}: {message}")]
    Conflict {
        source_id: String,
        position: CanonicalPosition,
        message: String,
    },

    /// Applying an event failed for a reason other than a conflict.
    #[error("Apply failed on {source_id} at {position}: {message}")]
    Apply {
        source_id: String,
        position: CanonicalPosition,
        message: String,
        transient: bool,
    },

    /// SQLite error in the position store or the durable event log.
    #[error("Position store error: {0}")]
    PositionStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ParsePositionError> for ReplicationError {
    fn from(e: ParsePositionError) -> Self {
        Self::Config(e.to_string())
    }
}

fn fmt_after(after: &Option<CanonicalPosition>) -> String {
    match after {
        Some(p) => p.to_string(),
        None => "beginning".to_string(),
    }
}

impl ReplicationError {
    /// Create a transport error for an endpoint.
    pub fn transport(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Create an upstream-unavailable error for a source.
    pub fn upstream_unavailable(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { .. } => true,
            Self::Transport { .. } => true,
            Self::Apply { transient, .. } => *transient,
            Self::UnknownSource { .. } => false, // Configuration problem
            Self::PositionNotAvailable { .. } => false, // Needs resync
            Self::Conflict { .. } => false,
            Self::Protocol(_) => false,
            Self::Decompression(_) => false,
            Self::PositionStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error is an application conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// The wire error kind used to report this error to a downstream peer.
    ///
    /// Errors without a wire counterpart are reported as
    /// `UpstreamUnavailable` so the downstream retries.
    pub fn wire_kind(&self) -> WireErrorKind {
        match self {
            Self::UnknownSource { .. } => WireErrorKind::UnknownSource,
            Self::PositionNotAvailable { .. } => WireErrorKind::PositionNotAvailable,
            _ => WireErrorKind::UpstreamUnavailable,
        }
    }

    /// Rebuild an error received in an `ERROR` frame.
    pub fn from_wire(
        kind: WireErrorKind,
        source_id: &str,
        requested: Option<CanonicalPosition>,
        message: String,
    ) -> Self {
        match kind {
            WireErrorKind::UnknownSource => Self::UnknownSource {
                source_id: source_id.to_string(),
            },
            WireErrorKind::PositionNotAvailable => Self::PositionNotAvailable {
                source_id: source_id.to_string(),
                requested,
            },
            WireErrorKind::UpstreamUnavailable => Self::UpstreamUnavailable {
                source_id: source_id.to_string(),
                message,
            },
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnknownSource { .. } => "unknown_source",
            Self::PositionNotAvailable { .. } => "position_not_available",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Transport { .. } => "transport",
            Self::Protocol(_) => "protocol",
            Self::Decompression(_) => "decompression",
            Self::Conflict { .. } => "conflict",
            Self::Apply { .. } => "apply",
            Self::PositionStore(_) => "position_store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
