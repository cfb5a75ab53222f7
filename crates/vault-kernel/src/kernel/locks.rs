//! Advisory record locks for multi-client editing.
//!
//! A lock is a row in `record_locks` with a 30-minute expiry. Acquisition is
//! upsert-based: expired rows and the caller's own rows are overwritten,
//! someone else's live row wins. Expiry comparisons happen inside SQLite
//! (`datetime('now')` against stored UTC text) so every client agrees on the
//! clock.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::kernel::db::{local_host, Db};
use crate::kernel::error::VaultError;
use crate::kernel::models::{LockInfo, TS_FORMAT};
use crate::kernel::retry::{with_retry, RetryPolicy};

/// Editing locks expire after this long without a refresh.
pub const LOCK_TTL_MINUTES: i64 = 30;

/// Outcome of a lock acquisition attempt.
#[derive(Clone, Debug)]
pub enum LockOutcome {
    Acquired,
    /// Someone else holds a live lock; the holder's details for the UI.
    HeldByOther(LockInfo),
}

impl LockOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

impl Db {
    /// Tries to take the editing lock on `record_id` for `username`.
    /// Re-acquiring one's own lock refreshes it.
    pub fn acquire_record_lock(
        &self,
        record_id: &str,
        username: &str,
    ) -> Result<LockOutcome, VaultError> {
        let now = Utc::now();
        let locked_at = now.format(TS_FORMAT).to_string();
        let expires_at = (now + ChronoDuration::minutes(LOCK_TTL_MINUTES))
            .format(TS_FORMAT)
            .to_string();
        let host = local_host();

        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "acquire record lock", || {
                conn.execute(
                    "DELETE FROM record_locks
                     WHERE record_id = ?1 AND lock_expires_at <= datetime('now')",
                    [record_id],
                )?;

                let holder: Option<LockInfo> = conn
                    .query_row(
                        "SELECT locked_by, locked_at, computer_name, lock_expires_at
                         FROM record_locks WHERE record_id = ?1",
                        [record_id],
                        |row| {
                            Ok(LockInfo {
                                locked: true,
                                locked_by: row.get(0)?,
                                locked_at: row.get(1)?,
                                computer_name: row.get(2)?,
                                lock_expires_at: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;

                if let Some(info) = holder {
                    if info.locked_by.as_deref() != Some(username) {
                        return Ok(LockOutcome::HeldByOther(info));
                    }
                }

                conn.execute(
                    "INSERT OR REPLACE INTO record_locks
                         (record_id, locked_by, locked_at, computer_name, lock_expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![record_id, username, locked_at, host, expires_at],
                )?;
                Ok(LockOutcome::Acquired)
            })
        })
        .map(|outcome| {
            if let LockOutcome::HeldByOther(info) = &outcome {
                tracing::debug!(
                    record_id,
                    holder = info.locked_by.as_deref().unwrap_or(""),
                    "record lock held by another user"
                );
            }
            outcome
        })
    }

    /// Releases the caller's lock. Releasing a lock one does not hold is a
    /// no-op and returns false.
    pub fn release_record_lock(
        &self,
        record_id: &str,
        username: &str,
    ) -> Result<bool, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "release record lock", || {
                let rows = conn.execute(
                    "DELETE FROM record_locks WHERE record_id = ?1 AND locked_by = ?2",
                    params![record_id, username],
                )?;
                Ok(rows > 0)
            })
        })
    }

    /// Extends the caller's lock by another TTL window. Returns false when
    /// the lock is gone (expired and swept, or taken by someone else).
    pub fn refresh_record_lock(
        &self,
        record_id: &str,
        username: &str,
    ) -> Result<bool, VaultError> {
        let expires_at = (Utc::now() + ChronoDuration::minutes(LOCK_TTL_MINUTES))
            .format(TS_FORMAT)
            .to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "refresh record lock", || {
                let rows = conn.execute(
                    "UPDATE record_locks SET lock_expires_at = ?1
                     WHERE record_id = ?2 AND locked_by = ?3
                       AND lock_expires_at > datetime('now')",
                    params![expires_at, record_id, username],
                )?;
                Ok(rows > 0)
            })
        })
    }

    /// Current lock state for a record. Expired rows report unlocked.
    pub fn lock_info(&self, record_id: &str) -> Result<LockInfo, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read record lock", || {
                let info = conn
                    .query_row(
                        "SELECT locked_by, locked_at, computer_name, lock_expires_at
                         FROM record_locks
                         WHERE record_id = ?1 AND lock_expires_at > datetime('now')",
                        [record_id],
                        |row| {
                            Ok(LockInfo {
                                locked: true,
                                locked_by: row.get(0)?,
                                locked_at: row.get(1)?,
                                computer_name: row.get(2)?,
                                lock_expires_at: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(info.unwrap_or_default())
            })
        })
    }

    /// Sweeps expired lock rows. Returns the number removed.
    pub fn cleanup_expired_locks(&self) -> Result<usize, VaultError> {
        let removed = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "cleanup expired locks", || {
                Ok(conn.execute(
                    "DELETE FROM record_locks WHERE lock_expires_at <= datetime('now')",
                    [],
                )?)
            })
        })?;
        if removed > 0 {
            tracing::debug!(removed, "swept expired record locks");
        }
        Ok(removed)
    }

    /// All live locks, keyed by record id. Admin maintenance view.
    pub fn all_locks(&self) -> Result<Vec<(String, LockInfo)>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list record locks", || {
                let mut stmt = conn.prepare(
                    "SELECT record_id, locked_by, locked_at, computer_name, lock_expires_at
                     FROM record_locks
                     WHERE lock_expires_at > datetime('now')
                     ORDER BY locked_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        LockInfo {
                            locked: true,
                            locked_by: row.get(1)?,
                            locked_at: row.get(2)?,
                            computer_name: row.get(3)?,
                            lock_expires_at: row.get(4)?,
                        },
                    ))
                })?;
                rows.collect()
            })
        })
    }

    /// Drops every lock held by `username`. Called on logout.
    pub fn release_user_locks(&self, username: &str) -> Result<usize, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "release user locks", || {
                Ok(conn.execute(
                    "DELETE FROM record_locks WHERE locked_by = ?1",
                    [username],
                )?)
            })
        })
    }
}
