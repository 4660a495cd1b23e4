// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                 shutdown()
//! Created ───────────► Running ─────────────────► ShuttingDown ──► Stopped
//!    │                                                               ▲
//!    │ start() failed (store unavailable)                            │
//!    ▼                                            shutdown() ────────┘
//! Failed ────────────────────────────────────────────────────────────
//! ```
//!
//! A halted Client does not change the engine state; it shows up in
//! [`HealthCheck`] instead, so one conflicting source never stops the others.

use crate::client::ClientState;
use crate::position::CanonicalPosition;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created; call [`start()`](super::ReplicationEngine::start).
    Created,

    /// Clients spawned and replicating.
    Running,

    /// Clients signalled; waiting for in-flight applies to commit.
    ShuttingDown,

    /// Clean shutdown complete. Safe to drop.
    Stopped,

    /// Startup failed. Check logs.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health of one replicated source.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source_id: String,
    /// Endpoint the source is pulled from.
    pub upstream: String,
    pub state: ClientState,
    /// Durable resume position (`None` = nothing applied yet).
    pub position: Option<CanonicalPosition>,
    /// Events applied since start.
    pub applied: u64,
    pub reconnects: u64,
    /// Why the Client halted, if it did.
    pub halted_reason: Option<String>,
}

/// Snapshot for health endpoints. Collecting it does no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with at least one source still replicating.
    pub ready: bool,
    /// Ready and no source halted.
    pub healthy: bool,
    pub sources_total: usize,
    /// Sources connected to their upstream (streaming or applying).
    pub sources_streaming: usize,
    pub sources_halted: usize,
    pub sources: Vec<SourceHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }
}
