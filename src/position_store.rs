// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable source positions, checkpointed in the same transaction as the data.
//!
//! Stores the last applied [`CanonicalPosition`] for each source in SQLite,
//! in the same database the applier writes to.
//!
//! # Atomic apply-and-checkpoint
//!
//! ```text
//! BEGIN
//!   read source_positions[source]      -> already past this event? skip
//!   applier.apply(tx, event)           -> data mutation
//!   upsert source_positions[source]    -> position = event.position
//! COMMIT
//! ```
//!
//! A crash anywhere before `COMMIT` rolls back both effects; on restart the
//! Client resumes strictly after the old position and the event is
//! re-delivered and applied exactly once. There is no in-memory cache and
//! no debounced flush: the position on disk is always the truth.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Standalone statements are retried with exponential backoff;
//! inside an apply transaction a busy error is reported as a transient
//! apply failure and the Client retries the whole unit.

use crate::applier::{ApplyError, Applier};
use crate::config::PositionStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::position::CanonicalPosition;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            // Fallback to message matching
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open a SQLite pool for `path` (`:memory:` for a private in-memory db).
pub(crate) async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    if path == IN_MEMORY {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
        // One connection that never recycles, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        return Ok(pool);
    }

    let journal = if wal_mode {
        sqlx::sqlite::SqliteJournalMode::Wal
    } else {
        sqlx::sqlite::SqliteJournalMode::Delete
    };
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(journal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(2) // Low concurrency needed
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Convert a position to SQLite integers.
pub(crate) fn to_sql(position: CanonicalPosition) -> Result<(i64, i64)> {
    let file = i64::try_from(position.log_file_index).map_err(|_| {
        ReplicationError::Internal(format!("position {} does not fit in SQLite", position))
    })?;
    let offset = i64::try_from(position.offset).map_err(|_| {
        ReplicationError::Internal(format!("position {} does not fit in SQLite", position))
    })?;
    Ok((file, offset))
}

/// Convert SQLite integers back to a position.
pub(crate) fn from_sql(file: i64, offset: i64) -> Result<CanonicalPosition> {
    match (u64::try_from(file), u64::try_from(offset)) {
        (Ok(f), Ok(o)) => Ok(CanonicalPosition::new(f, o)),
        _ => Err(ReplicationError::Internal(format!(
            "negative position {}:{} in database",
            file, offset
        ))),
    }
}

/// Source position entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    /// Source stream ID
    pub source_id: String,
    /// Last event applied and checkpointed
    pub position: CanonicalPosition,
    /// Timestamp of last update (unix millis)
    pub updated_at: i64,
}

/// Result of [`PositionStore::apply_and_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Event applied and position advanced.
    Applied,
    /// Position was already at or past the event; nothing done.
    AlreadyApplied,
}

/// Persistent source positions backed by SQLite.
pub struct PositionStore {
    /// SQLite connection pool (shared with the applier's transactions)
    pool: SqlitePool,
    /// Path to database file
    path: String,
}

impl PositionStore {
    /// Create a position store at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::connect(&path_str, true).await
    }

    /// Open the store described by `config`.
    pub async fn open(config: &PositionStoreConfig) -> Result<Self> {
        Self::connect(&config.sqlite_path, config.wal_mode).await
    }

    /// Private in-memory store (tests, ephemeral replicas).
    pub async fn in_memory() -> Result<Self> {
        Self::connect(IN_MEMORY, false).await
    }

    async fn connect(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing position store");
        let pool = open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_positions (
                source_id TEXT PRIMARY KEY,
                log_file_index INTEGER NOT NULL,
                log_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM source_positions")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            info!(count, "Restored source positions from previous run");
        }

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Last applied position for a source; `None` means "from the beginning".
    pub async fn get(&self, source_id: &str) -> Result<Option<CanonicalPosition>> {
        let pool = &self.pool;
        let row: Option<(i64, i64)> = execute_with_retry("position_get", || async {
            sqlx::query_as(
                "SELECT log_file_index, log_offset FROM source_positions WHERE source_id = ?",
            )
            .bind(source_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        row.map(|(f, o)| from_sql(f, o)).transpose()
    }

    /// All stored positions (for health reporting and debugging).
    pub async fn get_all(&self) -> Result<HashMap<String, SourcePosition>> {
        let pool = &self.pool;
        let rows: Vec<(String, i64, i64, i64)> = execute_with_retry("position_get_all", || async {
            sqlx::query_as(
                "SELECT source_id, log_file_index, log_offset, updated_at FROM source_positions",
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for (source_id, f, o, updated_at) in rows {
            out.insert(
                source_id.clone(),
                SourcePosition {
                    source_id,
                    position: from_sql(f, o)?,
                    updated_at,
                },
            );
        }
        Ok(out)
    }

    /// Operator override: set (or clear, with `None`) a source's position.
    ///
    /// Used after resyncing from a snapshot. Does not touch data.
    pub async fn reset(&self, source_id: &str, position: Option<CanonicalPosition>) -> Result<()> {
        let pool = &self.pool;
        match position {
            Some(position) => {
                let (file, offset) = to_sql(position)?;
                let now = chrono::Utc::now().timestamp_millis();
                execute_with_retry("position_reset", || async {
                    sqlx::query(UPSERT_POSITION)
                        .bind(source_id)
                        .bind(file)
                        .bind(offset)
                        .bind(now)
                        .execute(pool)
                        .await
                })
                .await?;
            }
            None => {
                execute_with_retry("position_reset", || async {
                    sqlx::query("DELETE FROM source_positions WHERE source_id = ?")
                        .bind(source_id)
                        .execute(pool)
                        .await
                })
                .await?;
            }
        }
        warn!(source_id = %source_id, position = %crate::position::display_after(position), "Source position reset");
        Ok(())
    }

    /// Apply `event` and advance the source position in one transaction.
    ///
    /// Returns `AlreadyApplied` without calling the applier when the stored
    /// position is at or past the event. Any applier error rolls the whole
    /// transaction back and leaves the stored position unchanged.
    pub async fn apply_and_checkpoint<A>(
        &self,
        source_id: &str,
        event: &Event,
        applier: &A,
    ) -> Result<CheckpointOutcome>
    where
        A: Applier + ?Sized,
    {
        let (file, offset) = to_sql(event.position)?;
        let mut tx = self.pool.begin().await.map_err(|e| self.tx_error(source_id, event, e))?;

        let current: Option<(i64, i64)> = sqlx::query_as(
            "SELECT log_file_index, log_offset FROM source_positions WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| self.tx_error(source_id, event, e))?;

        if let Some((f, o)) = current {
            let current = from_sql(f, o)?;
            if event.position <= current {
                debug!(
                    source_id = %source_id,
                    position = %event.position,
                    current = %current,
                    "Event already applied, skipping"
                );
                return Ok(CheckpointOutcome::AlreadyApplied);
            }
        }

        if let Err(e) = applier.apply(&mut *tx, event).await {
            // Dropping `tx` rolls back
            return Err(match e {
                ApplyError::Conflict(message) => ReplicationError::Conflict {
                    source_id: source_id.to_string(),
                    position: event.position,
                    message,
                },
                ApplyError::Transient(message) => ReplicationError::Apply {
                    source_id: source_id.to_string(),
                    position: event.position,
                    message,
                    transient: true,
                },
                ApplyError::Rejected(message) => ReplicationError::Apply {
                    source_id: source_id.to_string(),
                    position: event.position,
                    message,
                    transient: false,
                },
            });
        }

        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(UPSERT_POSITION)
            .bind(source_id)
            .bind(file)
            .bind(offset)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.tx_error(source_id, event, e))?;

        tx.commit().await.map_err(|e| self.tx_error(source_id, event, e))?;

        debug!(source_id = %source_id, position = %event.position, "Event applied and checkpointed");
        Ok(CheckpointOutcome::Applied)
    }

    /// Busy/locked inside the apply transaction is a transient apply failure.
    fn tx_error(&self, source_id: &str, event: &Event, e: sqlx::Error) -> ReplicationError {
        if is_sqlite_busy_error(&e) {
            ReplicationError::Apply {
                source_id: source_id.to_string(),
                position: event.position,
                message: e.to_string(),
                transient: true,
            }
        } else {
            ReplicationError::PositionStore(e)
        }
    }

    /// Underlying pool, for appliers that need their own schema setup.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path == IN_MEMORY {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("position_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Position store closed");
    }
}

const UPSERT_POSITION: &str = r#"
    INSERT INTO source_positions (source_id, log_file_index, log_offset, updated_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(source_id) DO UPDATE SET
        log_file_index = excluded.log_file_index,
        log_offset = excluded.log_offset,
        updated_at = excluded.updated_at
"#;

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore").field("path", &self.path).finish()
    }
}
