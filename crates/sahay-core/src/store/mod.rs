//! `SQLite`-backed storage shared by every subsystem.
//!
//! The store uses WAL mode so reads proceed concurrently with writes. A
//! single connection behind a mutex keeps transaction scope simple: every
//! mutating operation runs inside [`Store::with_tx`], which is also where
//! the audit append joins the domain write.

// SQLite returns i64 for row IDs and counts, but they're always non-negative
// in this schema. Mutex poisoning indicates a panic in another thread, which
// is unrecoverable.
#![allow(clippy::cast_sign_loss, clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};

use crate::error::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Formats a timestamp in the store's canonical form (RFC 3339 UTC with
/// microsecond precision). Fixed precision keeps string comparison in SQL
/// chronological.
#[must_use]
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp in RFC 3339 form.
///
/// # Errors
///
/// Returns `Validation` if the input is not RFC 3339.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("bad timestamp {s:?}: {e}")))
}

/// The shared relational store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens or creates the store at the given path and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns `Transient` if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store (tests and ephemeral pilots).
    ///
    /// # Errors
    ///
    /// Returns `Transient` if initialization fails.
    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a read-only closure against the connection.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Runs a closure inside a transaction: commit on `Ok`, rollback on
    /// `Err`. This is the boundary that binds domain writes to their audit
    /// entries.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or `Transient` if the transaction
    /// cannot be started or committed.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Reads a settings value.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn setting(&self, key: &str) -> Result<Option<String>, Error> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Writes a settings value (upsert).
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Tries to acquire the advisory lock for a periodic job.
    ///
    /// Locks are leases: an expired lease can be taken over, and the current
    /// holder may renew. Returns `true` when the caller holds the lock.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn try_advisory_lock(
        &self,
        job: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.with_tx(|tx| {
            let current: Option<(String, String)> = tx
                .query_row(
                    "SELECT holder, locked_until FROM job_locks WHERE job = ?1",
                    params![job],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((current_holder, locked_until)) = current {
                let expired = parse_ts(&locked_until).map(|t| t <= now).unwrap_or(true);
                if current_holder != holder && !expired {
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO job_locks (job, holder, locked_until) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job) DO UPDATE SET holder = excluded.holder,
                                                locked_until = excluded.locked_until",
                params![job, holder, fmt_ts(now + lease)],
            )?;
            Ok(true)
        })
    }

    /// Releases an advisory lock if the caller still holds it.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn advisory_unlock(&self, job: &str, holder: &str) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM job_locks WHERE job = ?1 AND holder = ?2",
                params![job, holder],
            )?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_schema() {
        let store = Store::in_memory().unwrap();
        store
            .with_conn(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'audit_log'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn settings_round_trip() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.setting("missing").unwrap(), None);
        store.set_setting("consent_document_version", "2").unwrap();
        assert_eq!(
            store.setting("consent_document_version").unwrap().as_deref(),
            Some("2")
        );
        store.set_setting("consent_document_version", "3").unwrap();
        assert_eq!(
            store.setting("consent_document_version").unwrap().as_deref(),
            Some("3")
        );
    }

    #[test]
    fn tx_rolls_back_on_error() {
        let store = Store::in_memory().unwrap();
        let result: Result<(), Error> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES ('k', 'v')",
                [],
            )?;
            Err(Error::Validation("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.setting("k").unwrap(), None);
    }

    #[test]
    fn advisory_lock_excludes_second_holder() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let lease = Duration::seconds(60);

        assert!(store.try_advisory_lock("sla", "a", lease, now).unwrap());
        assert!(!store.try_advisory_lock("sla", "b", lease, now).unwrap());
        // Holder may renew.
        assert!(store.try_advisory_lock("sla", "a", lease, now).unwrap());
        // Expired lease can be taken over.
        let later = now + Duration::seconds(120);
        assert!(store.try_advisory_lock("sla", "b", lease, later).unwrap());

        store.advisory_unlock("sla", "b").unwrap();
        assert!(store.try_advisory_lock("sla", "c", lease, later).unwrap());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = fmt_ts(parse_ts("2026-01-28T09:59:59Z").unwrap());
        let b = fmt_ts(parse_ts("2026-01-28T10:00:00Z").unwrap());
        assert!(a < b);
    }
}
