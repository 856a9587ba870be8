//! SQLite persistence
//!
//! A single connection behind a mutex. Every write operation of the engine runs
//! inside [`Store::transaction`], an IMMEDIATE transaction, so read-then-write
//! sequences (thread reuse, mail event merge) see a consistent snapshot. Unique
//! constraints on the dedup keys back this up when several processes share
//! one database file.

pub mod users;

pub use users::{NewUser, Privilege, User};

use crate::{CourierError, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT,
    is_staff INTEGER NOT NULL DEFAULT 0,
    is_superuser INTEGER NOT NULL DEFAULT 0,
    privileges TEXT NOT NULL DEFAULT '[]',
    group_names TEXT NOT NULL DEFAULT '[]',
    mail_interval_minutes INTEGER NOT NULL DEFAULT 0,
    mail_opt_out INTEGER NOT NULL DEFAULT 0,
    last_mailed_at TEXT
);

CREATE TABLE IF NOT EXISTS group_quotas (
    group_name TEXT PRIMARY KEY,
    max_threads INTEGER NOT NULL,
    max_negotiations INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    owner_id INTEGER NOT NULL,
    blocked_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, blocked_id)
);

CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_id INTEGER,
    topic TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_updater_id INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0,
    closed INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    recipient_count INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT,
    about_kind TEXT,
    about_id INTEGER,
    dedup_key TEXT
);

CREATE TABLE IF NOT EXISTS thread_toggles (
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    toggled_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, user_id)
);

CREATE TABLE IF NOT EXISTS recipients (
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    unread INTEGER NOT NULL DEFAULT 0,
    unread_at TEXT,
    counter INTEGER NOT NULL DEFAULT 0,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (thread_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    author_id INTEGER,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    spam_score REAL
);

CREATE TABLE IF NOT EXISTS negotiations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    closed INTEGER NOT NULL DEFAULT 0,
    thread_id INTEGER REFERENCES threads(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (source_id, target_id)
);

CREATE TABLE IF NOT EXISTS mail_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mail_type TEXT NOT NULL,
    user_id INTEGER,
    address TEXT,
    recipient_key TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    forced INTEGER NOT NULL DEFAULT 0,
    sent INTEGER NOT NULL DEFAULT 0,
    sent_at TEXT,
    discarded INTEGER NOT NULL DEFAULT 0,
    minimum_time TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_unique ON users(email) WHERE email IS NOT NULL AND email <> '';
CREATE INDEX IF NOT EXISTS idx_threads_author_created ON threads(author_id, created_at);
CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_dedup
    ON threads(dedup_key) WHERE dedup_key IS NOT NULL AND closed = 0 AND deleted = 0;
CREATE INDEX IF NOT EXISTS idx_recipients_user ON recipients(user_id, active, unread);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, deleted);
CREATE INDEX IF NOT EXISTS idx_negotiations_source_created ON negotiations(source_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_mail_events_pending
    ON mail_events(recipient_key, mail_type, forced) WHERE sent = 0 AND discarded = 0;
CREATE INDEX IF NOT EXISTS idx_mail_events_state ON mail_events(sent, discarded, forced);
"#;

/// SQLite-backed store shared by every component
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening courier database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CourierError::Storage("connection mutex poisoned".to_string()))
    }

    /// Run `f` inside one IMMEDIATE transaction
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against the connection without opening a transaction
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort as strings
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

/// Start of the current UTC day, the boundary for daily quotas
pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// `now` minus `days`, or `InvalidArgument` when that falls outside chrono's range
pub(crate) fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    Duration::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| CourierError::InvalidArgument(format!("{} days is out of range", days)))
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path().join("db").join("courier.db")).unwrap();

        let tables: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('threads', 'recipients', 'messages', 'mail_events', 'negotiations')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_days_before_rejects_out_of_range_ages() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            days_before(now, 10).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert!(matches!(
            days_before(now, 200_000_000),
            Err(CourierError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = Store::in_memory().unwrap();

        let result: Result<()> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO group_quotas (group_name, max_threads, max_negotiations) VALUES ('a', 1, 1)",
                [],
            )?;
            Err(CourierError::Other("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM group_quotas", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(early)).unwrap(), early);
    }

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 17, 30, 0).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()
        );
    }
}
