//! Shared SQLite handle and schema.
//!
//! # Storage layout
//!
//! | table              | holds                                            |
//! |--------------------|--------------------------------------------------|
//! | `robots`           | one row per robot: latest telemetry gauges, position, `last_update` |
//! | `robot_cameras`    | camera descriptors, at most one `active = 1` per robot |
//! | `control_sessions` | every control session ever created (history included) |
//!
//! Two partial unique indexes back the exclusivity rules at the storage
//! level: one occupying session per robot, one active camera per robot.
//!
//! Timestamps are stored as fixed-width RFC-3339 strings (microsecond
//! precision, `Z` suffix) so that they sort lexicographically.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::clock::Clock;
use crate::error::StoreError;

/// Cloneable handle to the SQLite database. All clones share one connection;
/// callers serialise on it, and every multi-statement mutation runs inside a
/// transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a persistent database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        info!(path, "opening teleop database");
        Self::init(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS robots (
                robot_id    TEXT NOT NULL PRIMARY KEY,
                name        TEXT,
                status      TEXT,
                battery     REAL,
                cpu         REAL,
                memory      REAL,
                disk        REAL,
                temperature REAL,
                lat         REAL,
                lng         REAL,
                last_update TEXT,
                created_at  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS robot_cameras (
                id       TEXT NOT NULL PRIMARY KEY,
                robot_id TEXT NOT NULL,
                name     TEXT NOT NULL,
                port     TEXT NOT NULL,
                active   INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS robot_cameras_by_robot
                ON robot_cameras (robot_id);
             CREATE UNIQUE INDEX IF NOT EXISTS robot_cameras_one_active
                ON robot_cameras (robot_id) WHERE active = 1;
             CREATE TABLE IF NOT EXISTS control_sessions (
                id                TEXT NOT NULL PRIMARY KEY,
                robot_id          TEXT NOT NULL,
                operator_id       INTEGER NOT NULL,
                status            TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL,
                disconnect_reason TEXT,
                disconnected_by   TEXT,
                disconnect_at     TEXT
             );
             CREATE INDEX IF NOT EXISTS control_sessions_by_robot
                ON control_sessions (robot_id, created_at);
             CREATE UNIQUE INDEX IF NOT EXISTS control_sessions_one_occupying
                ON control_sessions (robot_id) WHERE status <> 'disconnected';",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection. A poisoned lock is recovered: every mutation is
    /// transactional, so a panic mid-operation leaves no partial write.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Current time at storage precision, so values handed back to callers
/// compare equal to what a later read returns.
pub(crate) fn stamp(clock: &dyn Clock) -> DateTime<Utc> {
    clock.now().trunc_subsecs(6)
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// `true` when `err` is a UNIQUE / CHECK constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent_on_reopen() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("teleop.db");
        let path = path.to_string_lossy();
        Database::open(&path).expect("first open");
        Database::open(&path).expect("second open");
    }

    #[test]
    fn timestamps_roundtrip_with_fixed_width() {
        let now = Utc::now();
        let raw = fmt_ts(now);
        assert!(raw.ends_with('Z'));
        let back = parse_ts(0, &raw).unwrap();
        assert_eq!(fmt_ts(back), raw);
    }

    #[test]
    fn parse_ts_rejects_garbage() {
        assert!(parse_ts(3, "yesterday").is_err());
    }
}
