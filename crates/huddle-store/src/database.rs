//! Database connection management.
//!
//! The [`Database`] owns a single [`rusqlite::Connection`] behind a mutex and
//! hands out [`Tx`] views to closures. Every [`Database::write`] runs inside
//! an `IMMEDIATE` transaction, so a read-modify-write on a chat document or a
//! message row is linearizable with respect to every other writer, including
//! other processes sharing the same file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::migrations;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Mutex<Connection>,
}

/// A borrowed connection, inside a transaction for writes.
///
/// All typed CRUD helpers are implemented on this type.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl<'a> Tx<'a> {
    pub(crate) fn conn(&self) -> &'a Connection {
        self.conn
    }
}

impl Database {
    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// A private, throwaway database. Used by tests and local tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied write:
        // the transaction is rolled back when it is dropped.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run read-only queries.
    pub fn read<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.lock();
        f(&Tx { conn: &conn })
    }

    /// Run a read-modify-write atomically. Commits when `f` returns `Ok`,
    /// rolls back otherwise.
    pub fn write<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let out = f(&Tx { conn: &tx })?;

        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(StoreError::Timestamp(ms))
}

/// Convert a store error raised inside a row-mapping closure.
pub(crate) fn conversion_error(idx: usize, err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
