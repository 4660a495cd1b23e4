// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local appliers: turn an event payload into a mutation of the local store.
//!
//! The Client never talks to the local data store directly. It hands each
//! event to an [`Applier`] together with the open SQLite transaction that
//! will also carry the position checkpoint, so the data change and the
//! position advance commit (or roll back) as one unit.
//!
//! # Failure classification
//!
//! | `ApplyError` | Client reaction |
//! |--------------|-----------------|
//! | `Conflict` | Halt the source; operator must resolve |
//! | `Transient` | Roll back, back off, re-request from the saved position |
//! | `Rejected` | Halt the source (payload cannot be applied as-is) |

use crate::event::Event;
use sqlx::error::ErrorKind;
use sqlx::{Executor, SqliteConnection};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by [`Applier::apply`].
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send + 'a>>;

/// Why an event could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// A data-integrity violation (uniqueness, foreign key, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Temporary failure; applying the same event later may succeed.
    #[error("transient: {0}")]
    Transient(String),

    /// The payload can never be applied (malformed, unsupported).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for ApplyError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => Self::Conflict(db_err.message().to_string()),
                _ if is_busy(db_err.code().as_deref(), db_err.message()) => {
                    Self::Transient(db_err.message().to_string())
                }
                _ => Self::Rejected(db_err.message().to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                Self::Transient(e.to_string())
            }
            _ => Self::Rejected(e.to_string()),
        }
    }
}

/// SQLITE_BUSY = 5, SQLITE_LOCKED = 6
fn is_busy(code: Option<&str>, message: &str) -> bool {
    if let Some(code) = code {
        return code == "5" || code == "6";
    }
    let msg = message.to_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Applies event payloads inside a caller-owned transaction.
///
/// Implementations must do all their work through `conn`; anything written
/// elsewhere escapes the atomic apply-and-checkpoint unit.
pub trait Applier: Send + Sync + 'static {
    fn apply<'a>(&'a self, conn: &'a mut SqliteConnection, event: &'a Event) -> ApplyFuture<'a>;
}

/// Executes each payload as UTF-8 SQL against the local database.
///
/// This is the row-image-free equivalent of replaying statement-based
/// binlog events: whatever the source executed is executed here.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlStatementApplier;

impl Applier for SqlStatementApplier {
    fn apply<'a>(&'a self, conn: &'a mut SqliteConnection, event: &'a Event) -> ApplyFuture<'a> {
        Box::pin(async move {
            let sql = std::str::from_utf8(&event.payload)
                .map_err(|e| ApplyError::Rejected(format!("payload is not UTF-8: {}", e)))?;
            conn.execute(sql).await?;
            Ok(())
        })
    }
}
