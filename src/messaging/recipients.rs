//! Recipient tracker
//!
//! Per (thread, user) participation state: active flag, unread flag and date,
//! per-user message counter and the "acknowledged" badge bit. Acknowledged is
//! separate from read: a thread can be unread but already seen once.

use super::threads;
use super::types::{Message, Recipient, ThreadId, UserId};
use crate::cache::UnreadCache;
use crate::events::{Event, EventHandler, Verdict};
use crate::store::{parse_opt_ts, ts};
use crate::{CourierError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What leaving a thread did to the thread itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableEffect {
    /// Two or more participants remain
    Unchanged,
    /// One participant remains; the thread was closed
    ThreadClosed,
    /// Nobody remains; the thread was deleted
    ThreadDeleted,
}

const RECIPIENT_COLUMNS: &str =
    "thread_id, user_id, active, unread, unread_at, counter, acknowledged";

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        thread: row.get(0)?,
        user: row.get(1)?,
        active: row.get(2)?,
        unread: row.get(3)?,
        unread_at: parse_opt_ts(row.get(4)?)?,
        counter: row.get(5)?,
        acknowledged: row.get(6)?,
    })
}

/// Users currently participating in `thread`
pub(crate) fn active_participants(conn: &Connection, thread: ThreadId) -> Result<BTreeSet<UserId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id FROM recipients WHERE thread_id = ?1 AND active = 1 ORDER BY user_id",
    )?;
    let users = stmt
        .query_map(params![thread], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<UserId>>>()?;
    Ok(users)
}

/// Every user with a recipient row in `thread`, active or not
pub(crate) fn all_participants(conn: &Connection, thread: ThreadId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare_cached("SELECT user_id FROM recipients WHERE thread_id = ?1")?;
    let users = stmt
        .query_map(params![thread], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<UserId>>>()?;
    Ok(users)
}

/// Tracks read state and owns the unread-count cache
#[derive(Debug, Clone)]
pub struct RecipientTracker {
    cache: Arc<UnreadCache>,
}

impl RecipientTracker {
    pub fn new(cache: Arc<UnreadCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &UnreadCache {
        &self.cache
    }

    /// Insert recipient rows for a freshly created thread
    pub(crate) fn attach(
        &self,
        conn: &Connection,
        thread: ThreadId,
        users: &BTreeSet<UserId>,
    ) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO recipients (thread_id, user_id, active) VALUES (?1, ?2, 1)",
        )?;
        for user in users {
            stmt.execute(params![thread, user])?;
        }
        self.cache.invalidate_many(users.iter().copied());
        Ok(())
    }

    /// Add `user` to an existing thread, reactivating a former participant
    pub fn add(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<()> {
        conn.execute(
            "INSERT INTO recipients (thread_id, user_id, active) VALUES (?1, ?2, 1)
             ON CONFLICT(thread_id, user_id) DO UPDATE SET active = 1",
            params![thread, user],
        )?;
        // The participant set changed, so the thread no longer owns its dedup key.
        threads::clear_dedup_key(conn, thread)?;
        threads::refresh_counters(conn, thread)?;
        self.cache.invalidate(user);
        Ok(())
    }

    pub fn get(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<Option<Recipient>> {
        let sql = format!(
            "SELECT {} FROM recipients WHERE thread_id = ?1 AND user_id = ?2",
            RECIPIENT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![thread, user], row_to_recipient)
            .optional()?)
    }

    pub fn list(&self, conn: &Connection, thread: ThreadId) -> Result<Vec<Recipient>> {
        let sql = format!(
            "SELECT {} FROM recipients WHERE thread_id = ?1 ORDER BY user_id",
            RECIPIENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![thread], row_to_recipient)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn active_participants(&self, conn: &Connection, thread: ThreadId) -> Result<BTreeSet<UserId>> {
        active_participants(conn, thread)
    }

    /// Flag the thread unread for `user`; no-op unless `user` is an active recipient
    pub fn set_unread(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE recipients SET unread = 1, unread_at = ?3
             WHERE thread_id = ?1 AND user_id = ?2 AND active = 1",
            params![thread, user, ts(Utc::now())],
        )?;
        self.cache.invalidate(user);
        Ok(changed > 0)
    }

    /// Fan the unread flag out to everyone but the message author
    ///
    /// Returns the users flagged unread. The author's own record is marked read.
    pub fn set_unread_by_message(&self, conn: &Connection, message: &Message) -> Result<Vec<UserId>> {
        let mut flagged = Vec::new();
        for user in active_participants(conn, message.thread)? {
            if Some(user) == message.author {
                self.set_read(conn, message.thread, Some(user))?;
            } else if self.set_unread(conn, message.thread, user)? {
                flagged.push(user);
            }
        }
        Ok(flagged)
    }

    /// Clear unread for one recipient, or all of them when `user` is `None`
    ///
    /// Reading also acknowledges the thread.
    pub fn set_read(&self, conn: &Connection, thread: ThreadId, user: Option<UserId>) -> Result<usize> {
        let changed = match user {
            Some(user) => {
                let changed = conn.execute(
                    "UPDATE recipients SET unread = 0, unread_at = NULL, acknowledged = 1
                     WHERE thread_id = ?1 AND user_id = ?2",
                    params![thread, user],
                )?;
                self.cache.invalidate(user);
                changed
            }
            None => {
                let changed = conn.execute(
                    "UPDATE recipients SET unread = 0, unread_at = NULL, acknowledged = 1
                     WHERE thread_id = ?1",
                    params![thread],
                )?;
                self.cache.invalidate_many(all_participants(conn, thread)?);
                changed
            }
        };
        Ok(changed)
    }

    /// Mark threads as seen at least once without touching unread state
    pub fn acknowledge(&self, conn: &Connection, user: UserId, threads: &[ThreadId]) -> Result<usize> {
        let mut stmt = conn.prepare_cached(
            "UPDATE recipients SET acknowledged = 1 WHERE thread_id = ?1 AND user_id = ?2",
        )?;
        let mut changed = 0;
        for thread in threads {
            changed += stmt.execute(params![thread, user])?;
        }
        self.cache.invalidate(user);
        Ok(changed)
    }

    pub fn is_unread(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<bool> {
        Ok(self
            .get(conn, thread, user)?
            .is_some_and(|recipient| recipient.active && recipient.unread))
    }

    /// Number of live threads with unread messages for `user`, served from cache
    pub fn unread_count(&self, conn: &Connection, user: UserId) -> Result<usize> {
        if let Some(count) = self.cache.get(user) {
            return Ok(count);
        }
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recipients r JOIN threads t ON t.id = r.thread_id
             WHERE r.user_id = ?1 AND r.active = 1 AND r.unread = 1 AND t.deleted = 0",
            params![user],
            |row| row.get(0),
        )?;
        let count = count as usize;
        self.cache.put(user, count);
        Ok(count)
    }

    /// Number of live threads `user` has never opened (inbox badge)
    pub fn unacknowledged_count(&self, conn: &Connection, user: UserId) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recipients r JOIN threads t ON t.id = r.thread_id
             WHERE r.user_id = ?1 AND r.active = 1 AND r.acknowledged = 0 AND t.deleted = 0",
            params![user],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Recompute the per-user message counter from the message rows
    pub fn refresh_counter(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<u32> {
        conn.execute(
            "UPDATE recipients SET counter = (
                 SELECT COUNT(*) FROM messages
                 WHERE thread_id = ?1 AND author_id = ?2 AND deleted = 0)
             WHERE thread_id = ?1 AND user_id = ?2",
            params![thread, user],
        )?;
        Ok(self
            .get(conn, thread, user)?
            .map_or(0, |recipient| recipient.counter))
    }

    /// `user` leaves the thread
    ///
    /// The last participant leaving deletes the thread; leaving a single
    /// participant behind closes it.
    pub fn disable(&self, conn: &Connection, thread: ThreadId, user: UserId) -> Result<DisableEffect> {
        let recipient = self.get(conn, thread, user)?.ok_or_else(|| {
            CourierError::NotFound(format!("user {} is not a recipient of thread {}", user, thread))
        })?;
        if !recipient.active {
            return Ok(DisableEffect::Unchanged);
        }

        conn.execute(
            "UPDATE recipients SET active = 0, unread = 0, unread_at = NULL
             WHERE thread_id = ?1 AND user_id = ?2",
            params![thread, user],
        )?;
        threads::clear_dedup_key(conn, thread)?;
        threads::refresh_counters(conn, thread)?;
        self.cache.invalidate(user);

        let remaining = active_participants(conn, thread)?;
        let effect = match remaining.len() {
            0 => {
                threads::mark_deleted(conn, thread)?;
                DisableEffect::ThreadDeleted
            }
            1 => {
                threads::write_closed(conn, thread, true)?;
                DisableEffect::ThreadClosed
            }
            _ => DisableEffect::Unchanged,
        };
        self.cache.invalidate_many(remaining);

        tracing::debug!(thread_id = %thread, user_id = %user, effect = ?effect, "Recipient left thread");
        Ok(effect)
    }
}

/// Acknowledges a thread for the reader on `thread.read`
#[derive(Debug, Clone)]
pub struct ReadReceipt {
    tracker: RecipientTracker,
}

impl ReadReceipt {
    pub fn new(tracker: RecipientTracker) -> Self {
        Self { tracker }
    }
}

impl EventHandler for ReadReceipt {
    fn name(&self) -> &'static str {
        "read_receipt"
    }

    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict> {
        if let Event::ThreadRead { user, thread } = event {
            self.tracker.acknowledge(conn, *user, &[*thread])?;
        }
        Ok(Verdict::Accept)
    }
}
