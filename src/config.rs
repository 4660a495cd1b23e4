// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the Server, Relay and Client roles.
//!
//! All types deserialize from JSON with sensible defaults, so a config file
//! only needs the fields that differ. A node runs any combination of roles.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_id: String
//! ├── server: Option<ServerConfig>
//! │   ├── listen_addr
//! │   ├── sources: [{ source_id, event_log_path }]
//! │   └── session: SessionConfig
//! ├── relay: Option<RelayConfig>
//! │   ├── listen_addr
//! │   ├── upstreams: [{ source_id, upstream_addr }]
//! │   ├── cache: CacheConfig
//! │   ├── connect_timeout, circuit_*
//! │   └── session: SessionConfig
//! └── client: Option<ClientConfig>
//!     ├── sources: [{ source_id, upstream_addr }]
//!     ├── position_store: PositionStoreConfig
//!     ├── retry: RetrySettings
//!     └── rate_limit: Option<RateLimitConfig>
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "node_id": "eu-west.replica-3",
//!   "relay": {
//!     "listen_addr": "0.0.0.0:7400",
//!     "upstreams": [{ "source_id": "orders", "upstream_addr": "db-primary:7300" }],
//!     "cache": { "capacity": 50000, "max_entry_age": "10min" }
//!   },
//!   "client": {
//!     "sources": [{ "source_id": "orders", "upstream_addr": "127.0.0.1:7400" }],
//!     "position_store": { "sqlite_path": "/var/lib/mesh/positions.db" }
//!   }
//! }
//! ```
//!
//! Durations are `humantime` strings (`"500ms"`, `"5s"`, `"2min"`). An
//! unparsable duration falls back to the field's default at runtime;
//! [`ReplicationConfig::validate`] reports it up front.

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}

fn check_unique<'a>(section: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ReplicationError::Config(format!("{}: empty source_id", section)));
        }
        if !seen.insert(id) {
            return Err(ReplicationError::Config(format!(
                "{}: source {} configured twice",
                section, id
            )));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything one node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's identity, used in logs.
    pub node_id: String,

    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub relay: Option<RelayConfig>,

    #[serde(default)]
    pub client: Option<ClientConfig>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            server: None,
            relay: None,
            client: None,
        }
    }
}

impl ReplicationConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ReplicationError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject configs that would fail at startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_none() && self.relay.is_none() && self.client.is_none() {
            return Err(ReplicationError::Config(
                "no role configured (server, relay or client)".into(),
            ));
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(relay) = &self.relay {
            relay.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: wire sessions served by a Server or Relay
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-listener session settings shared by Server and Relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Concurrent sessions; further connections get a retryable error.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Events read from a source per batch.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// Events buffered between a producer and its session.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Payloads at least this large are zstd-compressed on the wire.
    /// `null` disables compression.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: Option<usize>,

    /// How long a new connection has to send its request.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,
}

fn default_max_sessions() -> usize {
    256
}

fn default_read_batch_size() -> usize {
    256
}

fn default_stream_buffer() -> usize {
    64
}

fn default_compression_threshold() -> Option<usize> {
    Some(4096)
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            read_batch_size: default_read_batch_size(),
            stream_buffer: default_stream_buffer(),
            compression_threshold: default_compression_threshold(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl SessionConfig {
    /// Small buffers and a short handshake for tests.
    pub fn for_testing() -> Self {
        Self {
            max_sessions: 16,
            read_batch_size: 16,
            stream_buffer: 8,
            compression_threshold: Some(64),
            handshake_timeout: "1s".to_string(),
        }
    }

    /// Handshake timeout; falls back to 10s.
    pub fn handshake_timeout(&self) -> Duration {
        parse_or(&self.handshake_timeout, Duration::from_secs(10))
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_sessions == 0 || self.stream_buffer == 0 {
            return Err(ReplicationError::Config(format!(
                "{}: max_sessions and stream_buffer must be positive",
                section
            )));
        }
        check_duration(&format!("{}.handshake_timeout", section), &self.handshake_timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server
// ═══════════════════════════════════════════════════════════════════════════════

/// A source served from a local event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub source_id: String,
    /// SQLite database holding the source's events.
    pub event_log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub session: SessionConfig,
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(ReplicationError::Config("server: missing listen_addr".into()));
        }
        check_unique("server", self.sources.iter().map(|s| s.source_id.as_str()))?;
        self.session.validate("server.session")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relay
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a source is pulled from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub source_id: String,
    /// `host:port` of a Server or Relay.
    pub upstream_addr: String,
}

impl UpstreamConfig {
    pub fn new(source_id: impl Into<String>, upstream_addr: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            upstream_addr: upstream_addr.into(),
        }
    }
}

/// Relay cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Cached events per source before the oldest-inserted is evicted.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Entries older than this are not served (e.g. `"10min"`). Unset keeps
    /// entries until capacity eviction.
    #[serde(default)]
    pub max_entry_age: Option<String>,

    /// Unclaimed events a fetch reads ahead before closing its upstream.
    #[serde(default = "default_read_ahead_events")]
    pub read_ahead_events: usize,
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_read_ahead_events() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            max_entry_age: None,
            read_ahead_events: default_read_ahead_events(),
        }
    }
}

impl CacheConfig {
    /// Parsed max entry age; an unparsable value disables age eviction.
    pub fn max_entry_age(&self) -> Option<Duration> {
        self.max_entry_age
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: String,

    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Bound on connecting to an upstream.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Window of upstream opens the circuit breaker judges.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit rejects before trial opens.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl RelayConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            upstreams: Vec::new(),
            cache: CacheConfig::default(),
            connect_timeout: default_connect_timeout(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
            session: SessionConfig::default(),
        }
    }

    /// Relay settings for tests: small cache, fast circuit recovery.
    pub fn for_testing() -> Self {
        Self {
            listen_addr: "test-relay".to_string(),
            upstreams: Vec::new(),
            cache: CacheConfig {
                capacity: 1_000,
                max_entry_age: None,
                read_ahead_events: 64,
            },
            connect_timeout: "500ms".to_string(),
            circuit_failure_threshold: 2,
            circuit_reset_timeout: "50ms".to_string(),
            session: SessionConfig::for_testing(),
        }
    }

    /// Connect timeout; falls back to 5s.
    pub fn connect_timeout(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(5))
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: CircuitConfig::default().success_threshold,
            recovery_timeout: parse_or(&self.circuit_reset_timeout, Duration::from_secs(30)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(ReplicationError::Config("relay: missing listen_addr".into()));
        }
        check_unique("relay", self.upstreams.iter().map(|u| u.source_id.as_str()))?;
        if self.cache.capacity == 0 {
            return Err(ReplicationError::Config("relay: cache capacity must be positive".into()));
        }
        if let Some(age) = &self.cache.max_entry_age {
            check_duration("relay.cache.max_entry_age", age)?;
        }
        check_duration("relay.connect_timeout", &self.connect_timeout)?;
        check_duration("relay.circuit_reset_timeout", &self.circuit_reset_timeout)?;
        self.session.validate("relay.session")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the Client keeps applied data and positions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionStoreConfig {
    /// SQLite database path, or `:memory:`.
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_positions.db".to_string(),
            wal_mode: true,
        }
    }
}

impl PositionStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: crate::position_store::IN_MEMORY.to_string(),
            wal_mode: false,
        }
    }
}

/// Serializable form of [`RetryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Consecutive failed sessions before halting; unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5min".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_connection_timeout() -> String {
    "30s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        let daemon = RetryConfig::daemon();
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(usize::MAX),
            initial_delay: parse_or(&self.initial_delay, daemon.initial_delay),
            max_delay: parse_or(&self.max_delay, daemon.max_delay),
            backoff_factor: if self.backoff_factor >= 1.0 {
                self.backoff_factor
            } else {
                daemon.backoff_factor
            },
            connection_timeout: parse_or(&self.connection_timeout, daemon.connection_timeout),
        }
    }

    fn validate(&self) -> Result<()> {
        check_duration("client.retry.initial_delay", &self.initial_delay)?;
        check_duration("client.retry.max_delay", &self.max_delay)?;
        check_duration("client.retry.connection_timeout", &self.connection_timeout)?;
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(ReplicationError::Config(format!(
                "client.retry.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ReplicationError::Config("client.retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Client role: one replication loop per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub sources: Vec<UpstreamConfig>,

    #[serde(default)]
    pub position_store: PositionStoreConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Use the bounded startup schedule until a source's first successful
    /// open, so a wrong upstream address halts instead of retrying forever.
    #[serde(default = "default_true")]
    pub bounded_startup: bool,

    /// Apply throttle shared by all sources; unset means unthrottled.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// How long shutdown waits for clients to finish their current event.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl ClientConfig {
    pub fn new(sources: Vec<UpstreamConfig>, position_store: PositionStoreConfig) -> Self {
        Self {
            sources,
            position_store,
            retry: RetrySettings::default(),
            bounded_startup: true,
            rate_limit: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    /// In-memory store and fast-fail retries.
    pub fn for_testing(sources: Vec<UpstreamConfig>) -> Self {
        Self {
            sources,
            position_store: PositionStoreConfig::in_memory(),
            retry: RetrySettings {
                max_attempts: Some(3),
                initial_delay: "10ms".to_string(),
                max_delay: "100ms".to_string(),
                backoff_factor: 2.0,
                connection_timeout: "500ms".to_string(),
            },
            bounded_startup: false,
            rate_limit: None,
            shutdown_timeout: "2s".to_string(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.retry_config()
    }

    /// Schedule used before a source first connects, if bounded.
    pub fn startup_retry_config(&self) -> Option<RetryConfig> {
        self.bounded_startup.then(RetryConfig::startup)
    }

    /// Shutdown drain timeout; falls back to 10s.
    pub fn shutdown_timeout(&self) -> Duration {
        parse_or(&self.shutdown_timeout, Duration::from_secs(10))
    }

    fn validate(&self) -> Result<()> {
        check_unique("client", self.sources.iter().map(|s| s.source_id.as_str()))?;
        if self.position_store.sqlite_path.is_empty() {
            return Err(ReplicationError::Config("client: missing position_store.sqlite_path".into()));
        }
        check_duration("client.shutdown_timeout", &self.shutdown_timeout)?;
        self.retry.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_client_config_gets_defaults() {
        let config = ReplicationConfig::from_json_str(
            r#"{
                "node_id": "replica-1",
                "client": { "sources": [{ "source_id": "db1", "upstream_addr": "relay:7400" }] }
            }"#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.sources, vec![UpstreamConfig::new("db1", "relay:7400")]);
        assert_eq!(client.position_store, PositionStoreConfig::default());
        assert!(client.rate_limit.is_none());
        assert_eq!(client.retry_config(), RetryConfig::daemon());
        assert_eq!(client.startup_retry_config(), Some(RetryConfig::startup()));
        assert_eq!(client.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_relay_config_parsing() {
        let config = ReplicationConfig::from_json_str(
            r#"{
                "node_id": "relay-1",
                "relay": {
                    "listen_addr": "0.0.0.0:7400",
                    "upstreams": [{ "source_id": "db1", "upstream_addr": "primary:7300" }],
                    "cache": { "capacity": 50, "max_entry_age": "2min" },
                    "connect_timeout": "750ms",
                    "session": { "compression_threshold": null }
                }
            }"#,
        )
        .unwrap();

        let relay = config.relay.unwrap();
        assert_eq!(relay.cache.capacity, 50);
        assert_eq!(relay.cache.max_entry_age(), Some(Duration::from_secs(120)));
        assert_eq!(relay.cache.read_ahead_events, 1024);
        assert_eq!(relay.connect_timeout(), Duration::from_millis(750));
        assert_eq!(relay.session.compression_threshold, None);
        assert_eq!(relay.session.max_sessions, 256);
        assert_eq!(relay.circuit_config().recovery_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_duration_fallbacks() {
        let session = SessionConfig {
            handshake_timeout: "soon".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(session.handshake_timeout(), Duration::from_secs(10));

        let cache = CacheConfig {
            max_entry_age: Some("whenever".to_string()),
            ..CacheConfig::default()
        };
        assert_eq!(cache.max_entry_age(), None);

        let retry = RetrySettings {
            initial_delay: "x".to_string(),
            backoff_factor: 0.5,
            ..RetrySettings::default()
        };
        let config = retry.retry_config();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.backoff_factor, 2.0);
    }

    #[test]
    fn test_validate_rejects_bad_durations() {
        let err = ReplicationConfig::from_json_str(
            r#"{ "node_id": "n", "client": { "sources": [], "retry": { "max_delay": "forever" } } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("client.retry.max_delay"), "{err}");
    }

    #[test]
    fn test_validate_rejects_duplicate_sources() {
        let err = ReplicationConfig::from_json_str(
            r#"{
                "node_id": "n",
                "server": {
                    "listen_addr": "0.0.0.0:7300",
                    "sources": [
                        { "source_id": "db1", "event_log_path": "a.db" },
                        { "source_id": "db1", "event_log_path": "b.db" }
                    ]
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
        assert!(err.to_string().contains("db1"));
    }

    #[test]
    fn test_validate_requires_a_role() {
        assert!(ReplicationConfig::default().validate().is_err());
        assert!(ReplicationConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{ "node_id": "n", "client": { "sources": [], "rate_limit": { "refill_rate": 20 } } }"#,
        )
        .unwrap();

        let config = ReplicationConfig::from_json_file(&path).unwrap();
        let rate = config.client.unwrap().rate_limit.unwrap();
        assert_eq!(rate.refill_rate, 20);
        assert_eq!(rate.burst_size, 100);

        assert!(ReplicationConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_testing_presets_validate() {
        let mut relay = RelayConfig::for_testing();
        relay.upstreams.push(UpstreamConfig::new("db1", "127.0.0.1:1"));
        let config = ReplicationConfig {
            node_id: "t".to_string(),
            server: None,
            relay: Some(relay),
            client: Some(ClientConfig::for_testing(vec![UpstreamConfig::new("db1", "127.0.0.1:1")])),
        };
        config.validate().unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.retry_config().max_attempts, 3);
        assert!(client.startup_retry_config().is_none());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig {
            node_id: "node-roundtrip".to_string(),
            server: Some(ServerConfig {
                listen_addr: "0.0.0.0:7300".to_string(),
                sources: vec![SourceConfig {
                    source_id: "db1".to_string(),
                    event_log_path: "/var/lib/mesh/db1.db".to_string(),
                }],
                session: SessionConfig::default(),
            }),
            relay: None,
            client: None,
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed = ReplicationConfig::from_json_str(&json).unwrap();
        let server = parsed.server.unwrap();
        assert_eq!(server.sources[0].event_log_path, "/var/lib/mesh/db1.db");
        assert_eq!(server.session, SessionConfig::default());
    }
}
