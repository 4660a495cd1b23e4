// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable event log stored in SQLite.
//!
//! Several sources may share one database file; rows are keyed by
//! `(source_id, log_file_index, log_offset)`. Head notifications only fire
//! for appends made through this handle, so a Server that serves a log
//! written by another process should own the writer in-process.

use super::{check_append, BoxFuture, EventSource};
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::position::CanonicalPosition;
use crate::position_store::{execute_with_retry, from_sql, open_pool, to_sql};
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use tokio::sync::watch;
use tracing::{debug, info};

/// SQLite-backed event log for one source.
pub struct SqliteEventLog {
    source_id: String,
    pool: SqlitePool,
    head_tx: watch::Sender<Option<CanonicalPosition>>,
}

impl SqliteEventLog {
    /// Open (creating if needed) the log for `source_id` in the file at `path`.
    pub async fn open(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let pool = open_pool(&path, true).await?;
        Self::with_pool(source_id, pool).await
    }

    /// Use an existing pool (e.g. one shared by several sources).
    pub async fn with_pool(source_id: impl Into<String>, pool: SqlitePool) -> Result<Self> {
        let source_id = source_id.into();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                source_id TEXT NOT NULL,
                log_file_index INTEGER NOT NULL,
                log_offset INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (source_id, log_file_index, log_offset)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_retention (
                source_id TEXT PRIMARY KEY,
                log_file_index INTEGER NOT NULL,
                log_offset INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let head = query_head(&pool, &source_id).await?;
        info!(source_id = %source_id, head = %crate::position::display_after(head), "Opened event log");

        let (head_tx, _) = watch::channel(head);
        Ok(Self {
            source_id,
            pool,
            head_tx,
        })
    }

    /// Append an event and wake any session waiting on the head.
    pub async fn append(&self, position: CanonicalPosition, payload: impl Into<Vec<u8>>) -> Result<()> {
        let head = query_head(&self.pool, &self.source_id).await?;
        check_append(&self.source_id, head, position)?;

        let (file, offset) = to_sql(position)?;
        let payload = payload.into();
        let pool = &self.pool;
        let source_id = self.source_id.as_str();
        execute_with_retry("event_append", || async {
            sqlx::query(
                "INSERT INTO events (source_id, log_file_index, log_offset, payload) VALUES (?, ?, ?, ?)",
            )
            .bind(source_id)
            .bind(file)
            .bind(offset)
            .bind(payload.as_slice())
            .execute(pool)
            .await
        })
        .await?;

        self.head_tx.send_replace(Some(position));
        debug!(source_id = %self.source_id, position = %position, "Event appended");
        Ok(())
    }

    /// Drop every event at or before `through` and raise the retention floor.
    pub async fn purge_through(&self, through: CanonicalPosition) -> Result<u64> {
        let (file, offset) = to_sql(through)?;
        let mut tx = self.pool.begin().await?;

        let purged = sqlx::query(
            r#"
            DELETE FROM events
            WHERE source_id = ?1
              AND (log_file_index < ?2 OR (log_file_index = ?2 AND log_offset <= ?3))
            "#,
        )
        .bind(&self.source_id)
        .bind(file)
        .bind(offset)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let current: Option<(i64, i64)> = sqlx::query_as(
            "SELECT log_file_index, log_offset FROM event_retention WHERE source_id = ?",
        )
        .bind(&self.source_id)
        .fetch_optional(&mut *tx)
        .await?;
        let keep_existing = match current {
            Some((f, o)) => from_sql(f, o)? >= through,
            None => false,
        };
        if !keep_existing {
            sqlx::query(
                r#"
                INSERT INTO event_retention (source_id, log_file_index, log_offset)
                VALUES (?, ?, ?)
                ON CONFLICT(source_id) DO UPDATE SET
                    log_file_index = excluded.log_file_index,
                    log_offset = excluded.log_offset
                "#,
            )
            .bind(&self.source_id)
            .bind(file)
            .bind(offset)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let head = query_head(&self.pool, &self.source_id).await?;
        self.head_tx.send_if_modified(|current| {
            if head > *current {
                *current = head;
                true
            } else {
                false
            }
        });
        debug!(source_id = %self.source_id, through = %through, purged, "Purged event log");
        Ok(purged)
    }

    async fn floor(&self) -> Result<Option<CanonicalPosition>> {
        let pool = &self.pool;
        let source_id = self.source_id.as_str();
        let row: Option<(i64, i64)> = execute_with_retry("event_floor", || async {
            sqlx::query_as(
                "SELECT log_file_index, log_offset FROM event_retention WHERE source_id = ?",
            )
            .bind(source_id)
            .fetch_optional(pool)
            .await
        })
        .await?;
        row.map(|(f, o)| from_sql(f, o)).transpose()
    }
}

/// Newest appended position, never below the retention floor.
///
/// Purging every retained event must not move the head backwards, or a
/// caught-up reader would be refused and older positions could be appended.
async fn query_head(pool: &SqlitePool, source_id: &str) -> Result<Option<CanonicalPosition>> {
    let row: Option<(i64, i64)> = execute_with_retry("event_head", || async {
        sqlx::query_as(
            r#"
            SELECT log_file_index, log_offset FROM (
                SELECT log_file_index, log_offset FROM events WHERE source_id = ?1
                UNION ALL
                SELECT log_file_index, log_offset FROM event_retention WHERE source_id = ?1
            )
            ORDER BY log_file_index DESC, log_offset DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(pool)
        .await
    })
    .await?;
    row.map(|(f, o)| from_sql(f, o)).transpose()
}

impl EventSource for SqliteEventLog {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn read_after<'a>(
        &'a self,
        after: Option<CanonicalPosition>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Event>> {
        Box::pin(async move {
            if let Some(floor) = self.floor().await? {
                if after.map_or(true, |a| a < floor) {
                    return Err(ReplicationError::PositionNotAvailable {
                        source_id: self.source_id.clone(),
                        requested: after,
                    });
                }
            }

            // (-1, -1) sorts before every stored position
            let (file, offset) = match after {
                Some(a) => to_sql(a)?,
                None => (-1, -1),
            };
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let pool = &self.pool;
            let source_id = self.source_id.as_str();

            let rows: Vec<(i64, i64, Vec<u8>)> = execute_with_retry("event_read", || async {
                sqlx::query_as(
                    r#"
                    SELECT log_file_index, log_offset, payload FROM events
                    WHERE source_id = ?1
                      AND (log_file_index > ?2 OR (log_file_index = ?2 AND log_offset > ?3))
                    ORDER BY log_file_index ASC, log_offset ASC
                    LIMIT ?4
                    "#,
                )
                .bind(source_id)
                .bind(file)
                .bind(offset)
                .bind(limit)
                .fetch_all(pool)
                .await
            })
            .await?;

            rows.into_iter()
                .map(|(f, o, payload)| -> Result<Event> {
                    Ok(Event::new(self.source_id.clone(), from_sql(f, o)?, payload))
                })
                .collect()
        })
    }

    fn latest_position(&self) -> BoxFuture<'_, Option<CanonicalPosition>> {
        Box::pin(async move { query_head(&self.pool, &self.source_id).await })
    }

    fn retention_floor(&self) -> BoxFuture<'_, Option<CanonicalPosition>> {
        Box::pin(self.floor())
    }

    fn subscribe(&self) -> watch::Receiver<Option<CanonicalPosition>> {
        self.head_tx.subscribe()
    }
}

impl std::fmt::Debug for SqliteEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventLog")
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::check_available;
    use tempfile::tempdir;

    fn p(f: u64, o: u64) -> CanonicalPosition {
        CanonicalPosition::new(f, o)
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let log = SqliteEventLog::open("db1", dir.path().join("events.db")).await.unwrap();
        assert_eq!(log.latest_position().await.unwrap(), None);

        log.append(p(0, 100), b"a".to_vec()).await.unwrap();
        log.append(p(0, 250), b"b".to_vec()).await.unwrap();
        log.append(p(1, 10), b"c".to_vec()).await.unwrap();

        let all = log.read_after(None, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.position).collect::<Vec<_>>(),
            vec![p(0, 100), p(0, 250), p(1, 10)]
        );
        assert_eq!(all[2].payload, b"c");

        let tail = log.read_after(Some(p(0, 250)), 100).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].position, p(1, 10));

        assert_eq!(log.read_after(None, 2).await.unwrap().len(), 2);
        assert_eq!(log.latest_position().await.unwrap(), Some(p(1, 10)));
    }

    #[tokio::test]
    async fn test_reopen_restores_head() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let log = SqliteEventLog::open("db1", &path).await.unwrap();
            log.append(p(2, 7), b"x".to_vec()).await.unwrap();
        }
        let log = SqliteEventLog::open("db1", &path).await.unwrap();
        assert_eq!(*log.subscribe().borrow(), Some(p(2, 7)));
        assert!(log.append(p(2, 7), b"dup".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_sources_share_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        let a = SqliteEventLog::open("a", &path).await.unwrap();
        let b = SqliteEventLog::with_pool("b", a.pool.clone()).await.unwrap();
        a.append(p(0, 1), b"a1".to_vec()).await.unwrap();
        b.append(p(0, 1), b"b1".to_vec()).await.unwrap();
        b.append(p(0, 2), b"b2".to_vec()).await.unwrap();

        assert_eq!(a.read_after(None, 10).await.unwrap().len(), 1);
        assert_eq!(b.read_after(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_and_floor() {
        let dir = tempdir().unwrap();
        let log = SqliteEventLog::open("db1", dir.path().join("events.db")).await.unwrap();
        for (i, pos) in [p(0, 1), p(0, 2), p(1, 0)].into_iter().enumerate() {
            log.append(pos, vec![i as u8]).await.unwrap();
        }
        assert_eq!(log.purge_through(p(0, 2)).await.unwrap(), 2);
        assert_eq!(log.retention_floor().await.unwrap(), Some(p(0, 2)));

        // Purging an older point does not lower the floor
        log.purge_through(p(0, 1)).await.unwrap();
        assert_eq!(log.retention_floor().await.unwrap(), Some(p(0, 2)));

        assert!(matches!(
            log.read_after(Some(p(0, 1)), 10).await.unwrap_err(),
            ReplicationError::PositionNotAvailable { .. }
        ));
        let rest = log.read_after(Some(p(0, 2)), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].position, p(1, 0));
    }

    #[tokio::test]
    async fn test_full_purge_keeps_head() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        let log = SqliteEventLog::open("db1", &path).await.unwrap();
        log.append(p(0, 100), b"a".to_vec()).await.unwrap();
        log.append(p(1, 10), b"b".to_vec()).await.unwrap();
        assert_eq!(log.purge_through(p(1, 10)).await.unwrap(), 2);

        assert_eq!(log.latest_position().await.unwrap(), Some(p(1, 10)));
        let floor = log.retention_floor().await.unwrap();
        let head = log.latest_position().await.unwrap();
        assert!(check_available("db1", Some(p(1, 10)), floor, head).is_ok());
        assert!(log.read_after(Some(p(1, 10)), 10).await.unwrap().is_empty());

        // Nothing at or below the purged head may be appended
        assert!(log.append(p(0, 5), b"old".to_vec()).await.is_err());
        assert!(log.append(p(1, 10), b"dup".to_vec()).await.is_err());
        log.append(p(1, 11), b"c".to_vec()).await.unwrap();

        // Survives a reopen
        drop(log);
        let log = SqliteEventLog::open("db1", &path).await.unwrap();
        assert_eq!(*log.subscribe().borrow(), Some(p(1, 11)));
    }

    #[tokio::test]
    async fn test_purge_past_head_raises_head() {
        let dir = tempdir().unwrap();
        let log = SqliteEventLog::open("db1", dir.path().join("events.db")).await.unwrap();
        log.append(p(0, 1), b"a".to_vec()).await.unwrap();
        log.purge_through(p(3, 0)).await.unwrap();
        assert_eq!(*log.subscribe().borrow(), Some(p(3, 0)));
        assert!(log.append(p(2, 9), b"b".to_vec()).await.is_err());
    }
}
