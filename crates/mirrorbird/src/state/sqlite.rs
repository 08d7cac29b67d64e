//! SQLite-backed [`StateStore`].
//!
//! A single `rusqlite::Connection` is shared behind an `Arc<Mutex<…>>` and
//! every operation runs on the blocking pool so rusqlite calls never stall
//! the tokio executor. The job lock's check-and-set runs inside a
//! `BEGIN IMMEDIATE` transaction, which takes the database write lock up
//! front and makes the observe/decide/write cycle atomic against other
//! writers, including other processes sharing the database file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{AccountCursor, MediaRecord, MediaStatus, MediaType, StateError, StateStore};

/// SQLite store for cursors, the media registry, and the job lock.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Open a private in-memory database. Used by tests.
    pub fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Read one media registry row. Not part of the engine's contract; used
    /// for introspection and tests.
    pub async fn get_media(&self, media_key: &str) -> Result<Option<MediaRecord>, StateError> {
        let media_key = media_key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT media_key, post_id, account_handle, media_url, media_type,
                            uploaded_at, sink_message_ids, status
                     FROM media_records WHERE media_key = ?1",
                    params![media_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;

            let Some((media_key, post_id, handle, url, kind, uploaded, ids, status)) = row else {
                return Ok(None);
            };
            Ok(Some(MediaRecord {
                media_key,
                post_id,
                account_handle: handle,
                media_url: url,
                media_type: MediaType::parse(&kind)?,
                uploaded_at: Some(parse_timestamp(&uploaded)?),
                sink_message_ids: parse_message_ids(&ids)?,
                status: MediaStatus::parse(&status)?,
            }))
        })
        .await
    }

    /// Run `f` with exclusive access to the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StateError> + Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            let conn = guard.as_mut().ok_or(StateError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StateError::Task {
            message: e.to_string(),
        })?
    }
}

/// Pragmas applied to every connection: WAL for concurrent readers, a busy
/// timeout instead of immediate failure, enforced foreign keys, and NORMAL
/// synchronous which is safe under WAL.
fn configure(conn: &Connection) -> Result<(), StateError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS account_cursors (
            handle              TEXT PRIMARY KEY,
            latest_seen_post_id TEXT,
            backfill_cursor     TEXT,
            backfill_done       INTEGER NOT NULL DEFAULT 0,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS media_records (
            media_key        TEXT PRIMARY KEY,
            post_id          TEXT NOT NULL,
            account_handle   TEXT NOT NULL,
            media_url        TEXT NOT NULL,
            media_type       TEXT NOT NULL CHECK (media_type IN ('photo','video','gif')),
            uploaded_at      TEXT NOT NULL,
            sink_message_ids TEXT NOT NULL,
            status           TEXT NOT NULL CHECK (status IN ('uploaded','skipped_oversize'))
        );

        CREATE INDEX IF NOT EXISTS media_records_account_idx
            ON media_records(account_handle, uploaded_at);

        CREATE TABLE IF NOT EXISTS job_locks (
            job_name     TEXT PRIMARY KEY,
            locked_until TEXT NOT NULL,
            holder_id    TEXT NOT NULL
        );",
    )?;

    // Older deployments predate per-account cooldowns; the column is added
    // in place. Schema evolution here is additive-only.
    let has_cooldown_column = conn
        .prepare("SELECT 1 FROM pragma_table_info('account_cursors') WHERE name = 'rate_limited_until'")?
        .exists([])?;
    if !has_cooldown_column {
        conn.execute(
            "ALTER TABLE account_cursors ADD COLUMN rate_limited_until TEXT",
            [],
        )?;
    }

    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt {
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_message_ids(raw: &str) -> Result<Vec<i64>, StateError> {
    serde_json::from_str(raw).map_err(|e| StateError::Corrupt {
        message: format!("bad sink_message_ids {raw:?}: {e}"),
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn init(&self) -> Result<(), StateError> {
        self.with_conn(|conn| init_schema(conn)).await
    }

    async fn get_account(&self, handle: &str) -> Result<AccountCursor, StateError> {
        let handle = handle.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT handle, latest_seen_post_id, backfill_cursor, backfill_done,
                            rate_limited_until, updated_at
                     FROM account_cursors WHERE handle = ?1",
                    params![handle],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((handle, latest, backfill, done, cooldown, updated)) = row else {
                return Ok(AccountCursor::empty(handle));
            };

            Ok(AccountCursor {
                handle,
                latest_seen_post_id: latest,
                backfill_cursor: backfill,
                backfill_done: done,
                rate_limited_until: cooldown.as_deref().map(parse_timestamp).transpose()?,
                updated_at: Some(parse_timestamp(&updated)?),
            })
        })
        .await
    }

    async fn put_account(&self, cursor: AccountCursor) -> Result<(), StateError> {
        self.with_conn(move |conn| {
            let updated_at = cursor.updated_at.unwrap_or_else(Utc::now);
            conn.execute(
                "INSERT INTO account_cursors
                     (handle, latest_seen_post_id, backfill_cursor, backfill_done,
                      rate_limited_until, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(handle) DO UPDATE SET
                     latest_seen_post_id = excluded.latest_seen_post_id,
                     backfill_cursor     = excluded.backfill_cursor,
                     backfill_done       = excluded.backfill_done,
                     rate_limited_until  = excluded.rate_limited_until,
                     updated_at          = excluded.updated_at",
                params![
                    cursor.handle,
                    cursor.latest_seen_post_id,
                    cursor.backfill_cursor,
                    cursor.backfill_done,
                    cursor.rate_limited_until.map(|t| t.to_rfc3339()),
                    updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn is_media_uploaded(&self, media_key: &str) -> Result<bool, StateError> {
        let media_key = media_key.to_string();
        self.with_conn(move |conn| {
            let exists = conn
                .prepare("SELECT 1 FROM media_records WHERE media_key = ?1")?
                .exists(params![media_key])?;
            Ok(exists)
        })
        .await
    }

    async fn mark_media(&self, record: MediaRecord) -> Result<(), StateError> {
        self.with_conn(move |conn| {
            let uploaded_at = record.uploaded_at.unwrap_or_else(Utc::now);
            let message_ids = serde_json::to_string(&record.sink_message_ids)
                .map_err(|e| StateError::corrupt(format!("unencodable message ids: {e}")))?;
            conn.execute(
                "INSERT OR REPLACE INTO media_records
                     (media_key, post_id, account_handle, media_url, media_type,
                      uploaded_at, sink_message_ids, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.media_key,
                    record.post_id,
                    record.account_handle,
                    record.media_url,
                    record.media_type.as_str(),
                    uploaded_at.to_rfc3339(),
                    message_ids,
                    record.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn acquire_lock(
        &self,
        job_name: &str,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, StateError> {
        let job_name = job_name.to_string();
        let holder_id = holder_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let current = tx
                .query_row(
                    "SELECT locked_until, holder_id FROM job_locks WHERE job_name = ?1",
                    params![job_name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            if let Some((locked_until, holder)) = current {
                let locked_until = parse_timestamp(&locked_until)?;
                if locked_until > now {
                    tracing::debug!(
                        job = %job_name,
                        holder = %holder,
                        until = %locked_until,
                        "job lock held, not acquiring"
                    );
                    // Expired locks fall through and are overwritten.
                    return Ok(false);
                }
            }

            let until = now + chrono::Duration::seconds(ttl_seconds);
            tx.execute(
                "INSERT OR REPLACE INTO job_locks (job_name, locked_until, holder_id)
                 VALUES (?1, ?2, ?3)",
                params![job_name, until.to_rfc3339(), holder_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release_lock(&self, job_name: &str, holder_id: &str) -> Result<(), StateError> {
        let job_name = job_name.to_string();
        let holder_id = holder_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM job_locks WHERE job_name = ?1 AND holder_id = ?2",
                params![job_name, holder_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), StateError> {
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StateError::Db(e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StateError::Task {
            message: e.to_string(),
        })?
    }
}
