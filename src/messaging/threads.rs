//! Thread registry
//!
//! Finds or creates conversation threads and owns their lifecycle: open,
//! closed, deleted and expired.
//!
//! With `unique` set, a request for a participant set that already has an open
//! thread reuses that thread instead of creating a new one. The lookup and the
//! insert run in the caller's transaction; the partial unique index on
//! `threads.dedup_key` catches writers that raced past the lookup, and the
//! loser retries as a lookup.

use super::messages::MessageAppender;
use super::recipients::{active_participants, all_participants, RecipientTracker};
use super::types::{ContentKind, ContentRef, ContentRegistry, Message, Thread, ThreadId, UserId};
use crate::config::MessagingConfig;
use crate::events::{Event, EventBus};
use crate::store::{days_before, is_constraint_violation, parse_opt_ts, parse_ts, ts, users};
use crate::{CourierError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parameters of [`ThreadRegistry::find_or_create`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRequest {
    pub author: UserId,
    pub recipients: BTreeSet<UserId>,
    pub topic: String,
    /// First message, if any
    pub body: Option<String>,
    /// Reuse an open thread with the same participants; `None` uses the configured default
    pub unique: Option<bool>,
    /// Skip the quota check and allow an empty recipient set
    pub force: bool,
    /// Close a newly created thread right away
    pub closed: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub about: Option<ContentRef>,
}

impl ThreadRequest {
    pub fn new(
        author: UserId,
        recipients: impl IntoIterator<Item = UserId>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            author,
            recipients: recipients.into_iter().collect(),
            topic: topic.into(),
            body: None,
            unique: None,
            force: false,
            closed: false,
            expires_at: None,
            about: None,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = Some(unique);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn about(mut self, reference: ContentRef) -> Self {
        self.about = Some(reference);
        self
    }
}

/// Result of [`ThreadRegistry::find_or_create`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadOutcome {
    pub thread: Thread,
    pub message: Option<Message>,
    /// False when an existing thread was reused
    pub created: bool,
}

const THREAD_COLUMNS: &str = "id, author_id, topic, created_at, updated_at, last_updater_id, \
     deleted, closed, message_count, recipient_count, expires_at, about_kind, about_id";

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    let about_kind: Option<String> = row.get(11)?;
    let about_id: Option<i64> = row.get(12)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Thread {
        id: row.get(0)?,
        author: row.get(1)?,
        topic: row.get(2)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        last_updater: row.get(5)?,
        deleted: row.get(6)?,
        closed: row.get(7)?,
        message_count: row.get(8)?,
        recipient_count: row.get(9)?,
        expires_at: parse_opt_ts(row.get(10)?)?,
        about: about_kind
            .zip(about_id)
            .map(|(kind, id)| ContentRef::new(ContentKind::parse(&kind), id)),
    })
}

/// Canonical key of a participant set
pub(crate) fn dedup_key(participants: &BTreeSet<UserId>) -> String {
    participants
        .iter()
        .map(|user| user.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn load(conn: &Connection, id: ThreadId) -> Result<Option<Thread>> {
    let sql = format!("SELECT {} FROM threads WHERE id = ?1", THREAD_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_thread).optional()?)
}

pub(crate) fn require(conn: &Connection, id: ThreadId) -> Result<Thread> {
    load(conn, id)?.ok_or_else(|| CourierError::not_found("thread", id))
}

/// Recompute thread and per-recipient counters from the rows
pub(crate) fn refresh_counters(conn: &Connection, id: ThreadId) -> Result<()> {
    conn.execute(
        "UPDATE threads SET
             message_count = (SELECT COUNT(*) FROM messages WHERE thread_id = ?1 AND deleted = 0),
             recipient_count = (SELECT COUNT(*) FROM recipients WHERE thread_id = ?1 AND active = 1)
         WHERE id = ?1",
        params![id],
    )?;
    conn.execute(
        "UPDATE recipients SET counter = (
             SELECT COUNT(*) FROM messages m
             WHERE m.thread_id = recipients.thread_id
               AND m.author_id = recipients.user_id AND m.deleted = 0)
         WHERE thread_id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Soft delete a thread and every message in it
pub(crate) fn mark_deleted(conn: &Connection, id: ThreadId) -> Result<()> {
    conn.execute(
        "UPDATE threads SET deleted = 1, dedup_key = NULL WHERE id = ?1",
        params![id],
    )?;
    conn.execute(
        "UPDATE messages SET deleted = 1 WHERE thread_id = ?1",
        params![id],
    )?;
    refresh_counters(conn, id)
}

pub(crate) fn clear_dedup_key(conn: &Connection, id: ThreadId) -> Result<()> {
    conn.execute(
        "UPDATE threads SET dedup_key = NULL WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Set the closed flag
///
/// Reopening gives up the dedup key when another open thread already holds it.
pub(crate) fn write_closed(conn: &Connection, id: ThreadId, closed: bool) -> Result<()> {
    if !closed {
        conn.execute(
            "UPDATE threads SET dedup_key = NULL
             WHERE id = ?1 AND dedup_key IS NOT NULL AND EXISTS (
                 SELECT 1 FROM threads other
                 WHERE other.dedup_key = threads.dedup_key AND other.id <> threads.id
                   AND other.closed = 0 AND other.deleted = 0)",
            params![id],
        )?;
    }
    conn.execute(
        "UPDATE threads SET closed = ?2 WHERE id = ?1",
        params![id, closed],
    )?;
    Ok(())
}

/// Creates, finds and retires threads
#[derive(Clone)]
pub struct ThreadRegistry {
    config: MessagingConfig,
    bus: Arc<EventBus>,
    recipients: RecipientTracker,
    appender: MessageAppender,
    content: ContentRegistry,
}

impl ThreadRegistry {
    pub fn new(
        config: MessagingConfig,
        bus: Arc<EventBus>,
        recipients: RecipientTracker,
        appender: MessageAppender,
        content: ContentRegistry,
    ) -> Self {
        Self {
            config,
            bus,
            recipients,
            appender,
            content,
        }
    }

    pub fn appender(&self) -> &MessageAppender {
        &self.appender
    }

    pub fn get(&self, conn: &Connection, id: ThreadId) -> Result<Thread> {
        require(conn, id)
    }

    /// Pre-create validation
    ///
    /// Returns the reasons the thread may not be created; empty means it may.
    pub fn validate(
        &self,
        conn: &Connection,
        author: UserId,
        recipients: &BTreeSet<UserId>,
        unique: bool,
        force: bool,
        about: Option<&ContentRef>,
    ) -> Result<Vec<String>> {
        users::require_user(conn, author)?;

        let mut reasons = Vec::new();
        let others: Vec<UserId> = recipients.iter().copied().filter(|u| *u != author).collect();
        if others.is_empty() && !force {
            reasons.push("a conversation needs at least one other participant".to_string());
        }
        for user in &others {
            if users::get_user(conn, *user)?.is_none() {
                reasons.push(format!("unknown recipient {}", user));
            }
        }
        if let Some(reference) = about {
            if !self.content.exists(conn, reference)? {
                reasons.push(format!("the referenced {} no longer exists", reference));
            }
        }

        reasons.extend(self.bus.publish(
            conn,
            &Event::ThreadPreCreate {
                author,
                recipients: recipients.clone(),
                unique,
                force,
            },
        )?);
        Ok(reasons)
    }

    /// Whether [`find_or_create`](Self::find_or_create) would pass validation
    ///
    /// Nothing is written.
    pub fn simulate(
        &self,
        conn: &Connection,
        author: UserId,
        recipients: &BTreeSet<UserId>,
        unique: Option<bool>,
        force: bool,
    ) -> Result<bool> {
        let unique = unique.unwrap_or(self.config.unique_threads);
        Ok(self
            .validate(conn, author, recipients, unique, force, None)?
            .is_empty())
    }

    /// Find a reusable thread or create one, then optionally post the first message
    pub fn find_or_create(&self, conn: &Connection, request: ThreadRequest) -> Result<ThreadOutcome> {
        let unique = request.unique.unwrap_or(self.config.unique_threads);
        let reasons = self.validate(
            conn,
            request.author,
            &request.recipients,
            unique,
            request.force,
            request.about.as_ref(),
        )?;
        if !reasons.is_empty() {
            return Err(CourierError::Rejected(reasons));
        }

        let mut participants = request.recipients.clone();
        participants.insert(request.author);

        let existing = if unique {
            self.find_unique(conn, &participants)?
        } else {
            None
        };
        let (thread, created) = match existing {
            Some(thread) => {
                tracing::debug!(thread_id = %thread.id, "Reusing thread with identical participants");
                (thread, false)
            }
            None => self.create(conn, &request, &participants, unique)?,
        };

        self.recipients
            .acknowledge(conn, request.author, &[thread.id])?;

        let message = match &request.body {
            Some(body) => Some(self.appender.append(conn, Some(request.author), thread.id, body)?),
            None => None,
        };

        if created && request.closed {
            write_closed(conn, thread.id, true)?;
        }

        Ok(ThreadOutcome {
            thread: require(conn, thread.id)?,
            message,
            created,
        })
    }

    fn create(
        &self,
        conn: &Connection,
        request: &ThreadRequest,
        participants: &BTreeSet<UserId>,
        unique: bool,
    ) -> Result<(Thread, bool)> {
        let key = unique.then(|| dedup_key(participants));

        let id = match self.insert_row(conn, request, key.as_deref()) {
            Ok(id) => id,
            Err(err) if is_constraint_violation(&err) => {
                let Some(key) = key.as_deref() else {
                    return Err(err.into());
                };
                if let Some(holder) = self.by_dedup_key(conn, key)? {
                    if holder.is_live_at(Utc::now())
                        && active_participants(conn, holder.id)? == *participants
                    {
                        return Ok((holder, false));
                    }
                    // Stale holder (expired): it gives up the key.
                    clear_dedup_key(conn, holder.id)?;
                }
                self.insert_row(conn, request, Some(key))?
            }
            Err(err) => return Err(err.into()),
        };

        self.recipients.attach(conn, id, participants)?;
        refresh_counters(conn, id)?;

        self.bus.notify(
            conn,
            &Event::ThreadCreated {
                author: Some(request.author),
                thread: id,
            },
        )?;
        tracing::info!(
            thread_id = %id,
            author = %request.author,
            participants = participants.len(),
            "Created thread"
        );

        Ok((require(conn, id)?, true))
    }

    fn insert_row(
        &self,
        conn: &Connection,
        request: &ThreadRequest,
        key: Option<&str>,
    ) -> rusqlite::Result<ThreadId> {
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO threads (author_id, topic, created_at, updated_at, last_updater_id,
                                  expires_at, about_kind, about_id, dedup_key)
             VALUES (?1, ?2, ?3, ?3, ?1, ?4, ?5, ?6, ?7)",
            params![
                request.author,
                request.topic,
                now,
                request.expires_at.map(ts),
                request.about.as_ref().map(|r| r.kind.as_str().to_string()),
                request.about.as_ref().map(|r| r.id),
                key,
            ],
        )?;
        Ok(ThreadId(conn.last_insert_rowid()))
    }

    fn by_dedup_key(&self, conn: &Connection, key: &str) -> Result<Option<Thread>> {
        let sql = format!(
            "SELECT {} FROM threads WHERE dedup_key = ?1 AND closed = 0 AND deleted = 0",
            THREAD_COLUMNS
        );
        Ok(conn.query_row(&sql, params![key], row_to_thread).optional()?)
    }

    /// Open, non-deleted, unexpired thread whose active participants are exactly `participants`
    ///
    /// Among several matches a thread not authored by staff wins; otherwise the
    /// oldest match is used.
    pub fn find_unique(
        &self,
        conn: &Connection,
        participants: &BTreeSet<UserId>,
    ) -> Result<Option<Thread>> {
        let Some(anchor) = participants.iter().next() else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT {} FROM threads t
             WHERE t.deleted = 0 AND t.closed = 0
               AND (t.expires_at IS NULL OR t.expires_at > ?2)
               AND t.recipient_count = ?3
               AND EXISTS (SELECT 1 FROM recipients r
                           WHERE r.thread_id = t.id AND r.user_id = ?1 AND r.active = 1)
             ORDER BY t.id",
            THREAD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(
                params![anchor, ts(Utc::now()), participants.len() as i64],
                row_to_thread,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matches = Vec::new();
        for thread in candidates {
            if active_participants(conn, thread.id)? == *participants {
                matches.push(thread);
            }
        }

        for thread in &matches {
            let staff_authored = match thread.author {
                Some(author) => users::get_user(conn, author)?.is_some_and(|u| u.is_privileged()),
                None => false,
            };
            if !staff_authored {
                return Ok(Some(thread.clone()));
            }
        }
        Ok(matches.into_iter().next())
    }

    /// Close, reopen (`Some`) or invert (`None`) a thread
    ///
    /// Staff may toggle at any time. The author may toggle once the cooldown
    /// since their previous toggle of this thread has passed. Everyone else is
    /// refused. Asking for the current state changes nothing and does not
    /// start a cooldown. Returns whether the state changed.
    pub fn set_closed(
        &self,
        conn: &Connection,
        id: ThreadId,
        desired: Option<bool>,
        actor: UserId,
    ) -> Result<bool> {
        let thread = require(conn, id)?;
        if thread.deleted {
            return Ok(false);
        }
        let user = users::require_user(conn, actor)?;
        let now = Utc::now();

        if !user.is_privileged() {
            if thread.author != Some(actor) {
                return Ok(false);
            }
            if let Some(last) = self.last_toggle(conn, id, actor)? {
                if now - last <= self.config.toggle_cooldown() {
                    tracing::debug!(thread_id = %id, user_id = %actor, "Toggle refused during cooldown");
                    return Ok(false);
                }
            }
        }

        let closed = desired.unwrap_or(!thread.closed);
        if closed == thread.closed {
            return Ok(false);
        }
        write_closed(conn, id, closed)?;
        conn.execute(
            "INSERT INTO thread_toggles (thread_id, user_id, toggled_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(thread_id, user_id) DO UPDATE SET toggled_at = ?3",
            params![id, actor, ts(now)],
        )?;

        tracing::info!(thread_id = %id, user_id = %actor, closed, "Thread toggled");
        Ok(true)
    }

    fn last_toggle(
        &self,
        conn: &Connection,
        id: ThreadId,
        user: UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = conn
            .query_row(
                "SELECT toggled_at FROM thread_toggles WHERE thread_id = ?1 AND user_id = ?2",
                params![id, user],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parse_opt_ts(value)?)
    }

    /// Soft delete, or remove the rows entirely when `clear` is set
    pub fn delete(&self, conn: &Connection, id: ThreadId, clear: bool) -> Result<()> {
        require(conn, id)?;
        let participants = all_participants(conn, id)?;

        if clear {
            conn.execute("DELETE FROM threads WHERE id = ?1", params![id])?;
        } else {
            mark_deleted(conn, id)?;
        }
        self.recipients.cache().invalidate_many(participants);

        tracing::info!(thread_id = %id, clear, "Deleted thread");
        Ok(())
    }

    /// Delete threads last updated more than `days` ago
    ///
    /// Returns how many threads were deleted.
    pub fn delete_older_than(
        &self,
        conn: &Connection,
        days: u32,
        only_closed_or_deleted: bool,
        clear: bool,
    ) -> Result<usize> {
        let cutoff = days_before(Utc::now(), days)?;
        let mut sql = String::from("SELECT id FROM threads WHERE updated_at < ?1");
        if only_closed_or_deleted {
            sql.push_str(" AND (closed = 1 OR deleted = 1)");
        }
        if !clear {
            sql.push_str(" AND deleted = 0");
        }

        let ids = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![ts(cutoff)], |row| row.get::<_, ThreadId>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for id in &ids {
            self.delete(conn, *id, clear)?;
        }
        tracing::info!(days, deleted = ids.len(), clear, "Pruned old threads");
        Ok(ids.len())
    }

    /// Threads `user` actively participates in, most recently updated first
    pub fn inbox(&self, conn: &Connection, user: UserId, include_closed: bool) -> Result<Vec<Thread>> {
        let sql = format!(
            "SELECT {} FROM threads t
             WHERE t.deleted = 0 AND (?2 OR t.closed = 0)
               AND EXISTS (SELECT 1 FROM recipients r
                           WHERE r.thread_id = t.id AND r.user_id = ?1 AND r.active = 1)
             ORDER BY t.updated_at DESC, t.id DESC",
            THREAD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let threads = stmt
            .query_map(params![user, include_closed], row_to_thread)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(threads)
    }

    /// The thread, if `user` may see it
    ///
    /// Staff see every thread that is not deleted; everyone else must be an
    /// active recipient.
    pub fn check_access(&self, conn: &Connection, id: ThreadId, user: UserId) -> Result<Thread> {
        let thread = require(conn, id)?;
        if thread.deleted {
            return Err(CourierError::not_found("thread", id));
        }
        let actor = users::require_user(conn, user)?;
        if actor.is_privileged() {
            return Ok(thread);
        }
        match self.recipients.get(conn, id, user)? {
            Some(recipient) if recipient.active => Ok(thread),
            _ => Err(CourierError::PermissionDenied(format!(
                "user {} is not a participant of thread {}",
                user, id
            ))),
        }
    }

    /// Invite `user` into a live thread on behalf of its author or staff
    pub fn add_participant(
        &self,
        conn: &Connection,
        id: ThreadId,
        user: UserId,
        actor: UserId,
    ) -> Result<()> {
        let thread = require(conn, id)?;
        if !thread.is_live_at(Utc::now()) {
            return Err(CourierError::PermissionDenied(format!(
                "thread {} is not open",
                id
            )));
        }
        let actor_user = users::require_user(conn, actor)?;
        if !actor_user.is_privileged() && thread.author != Some(actor) {
            return Err(CourierError::PermissionDenied(
                "only the author may invite participants".to_string(),
            ));
        }
        users::require_user(conn, user)?;
        if self.config.blacklist_enabled && users::is_blocked(conn, user, actor)? {
            return Err(CourierError::PermissionDenied(format!(
                "user {} does not accept contact from user {}",
                user, actor
            )));
        }
        self.recipients.add(conn, id, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::{messenger, messenger_with, seed_users};
    use crate::CourierConfig;
    use chrono::Duration;

    #[test]
    fn test_dedup_key_is_order_independent() {
        let a: BTreeSet<_> = [UserId(3), UserId(1), UserId(2)].into_iter().collect();
        assert_eq!(dedup_key(&a), "1,2,3");
    }

    #[test]
    fn test_find_or_create_reuses_thread() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b, c] = seed_users(tx, ["a", "b", "c"])?;
                let first = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b, c], "plans"))?;
                assert!(first.created);
                assert_eq!(first.thread.recipient_count, 3);
                assert!(first.message.is_none());

                let second = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [c, b], "other topic"))?;
                assert!(!second.created);
                assert_eq!(second.thread.id, first.thread.id);

                let narrower = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "plans"))?;
                assert!(narrower.created);
                assert_ne!(narrower.thread.id, first.thread.id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_non_unique_always_creates() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let first = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x").unique(false))?;
                let second = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x").unique(false))?;
                assert!(second.created);
                assert_ne!(first.thread.id, second.thread.id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_closed_and_expired_threads_are_not_reused() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let closed = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x").closed())?;
                assert!(closed.thread.closed);

                let expired = m.threads().find_or_create(
                    tx,
                    ThreadRequest::new(a, [b], "y").expires_at(Utc::now() - Duration::minutes(1)),
                )?;
                assert!(expired.created);
                assert_ne!(expired.thread.id, closed.thread.id);

                let fresh = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "z"))?;
                assert!(fresh.created);
                assert_ne!(fresh.thread.id, expired.thread.id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_prefers_thread_not_authored_by_staff() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a] = seed_users(tx, ["a"])?;
                let staff = users::insert_user(tx, &users::NewUser::new("mod").staff())?.id;
                let by_staff = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(staff, [a], "warning").unique(false))?;
                let by_member = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [staff], "question").unique(false))?;
                assert!(by_staff.thread.id < by_member.thread.id);

                let participants: BTreeSet<_> = [a, staff].into_iter().collect();
                let found = m.threads().find_unique(tx, &participants)?.unwrap();
                assert_eq!(found.id, by_member.thread.id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_empty_recipients_rejected_unless_forced() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a] = seed_users(tx, ["a"])?;
                let err = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, Vec::new(), "notes"))
                    .unwrap_err();
                assert!(err.is_rejection());

                let forced = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, Vec::new(), "notes").force())?;
                assert_eq!(forced.thread.recipient_count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_simulate_has_no_side_effects() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let set: BTreeSet<_> = [b].into_iter().collect();
                assert!(m.threads().simulate(tx, a, &set, None, false)?);
                assert!(!m.threads().simulate(tx, a, &BTreeSet::new(), None, false)?);

                let count: i64 = tx.query_row("SELECT COUNT(*) FROM threads", [], |r| r.get(0))?;
                assert_eq!(count, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_orphaned_subject_rejected() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let err = m
                    .threads()
                    .find_or_create(
                        tx,
                        ThreadRequest::new(a, [b], "about").about(ContentRef::new(ContentKind::Message, 999)),
                    )
                    .unwrap_err();
                assert!(err.reasons()[0].contains("message:999"));

                let ok = m.threads().find_or_create(
                    tx,
                    ThreadRequest::new(a, [b], "about").about(ContentRef::new(ContentKind::User, b.0)),
                )?;
                assert_eq!(ok.thread.about, Some(ContentRef::new(ContentKind::User, b.0)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_toggle_rules() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let staff = users::insert_user(tx, &users::NewUser::new("admin").superuser())?.id;
                let thread = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x"))?
                    .thread;

                assert!(!m.threads().set_closed(tx, thread.id, None, b)?);

                assert!(m.threads().set_closed(tx, thread.id, None, a)?);
                assert!(m.threads().get(tx, thread.id)?.closed);

                // Within the cooldown.
                assert!(!m.threads().set_closed(tx, thread.id, Some(false), a)?);

                assert!(m.threads().set_closed(tx, thread.id, Some(false), staff)?);
                assert!(!m.threads().get(tx, thread.id)?.closed);

                let long_ago = ts(Utc::now() - Duration::hours(2));
                tx.execute(
                    "UPDATE thread_toggles SET toggled_at = ?1 WHERE thread_id = ?2 AND user_id = ?3",
                    params![long_ago, thread.id, a],
                )?;
                assert!(m.threads().set_closed(tx, thread.id, Some(true), a)?);
                assert!(m.threads().get(tx, thread.id)?.closed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_requesting_current_state_keeps_author_free_to_toggle() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let thread = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x"))?
                    .thread;

                assert!(!m.threads().set_closed(tx, thread.id, Some(false), a)?);
                assert!(m.threads().last_toggle(tx, thread.id, a)?.is_none());

                assert!(m.threads().set_closed(tx, thread.id, Some(true), a)?);
                assert!(m.threads().get(tx, thread.id)?.closed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reopen_gives_up_contested_dedup_key() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let admin = users::insert_user(tx, &users::NewUser::new("admin").staff())?.id;
                let old = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "x"))?.thread;
                m.threads().set_closed(tx, old.id, Some(true), admin)?;
                let new = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "y"))?.thread;
                assert_ne!(old.id, new.id);

                assert!(m.threads().set_closed(tx, old.id, Some(false), admin)?);
                assert!(!m.threads().get(tx, old.id)?.closed);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_soft_and_hard_delete() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let soft = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "x").body("hi").unique(false))?;
                m.threads().delete(tx, soft.thread.id, false)?;
                let thread = m.threads().get(tx, soft.thread.id)?;
                assert!(thread.deleted);
                assert_eq!(thread.message_count, 0);

                let hard = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [b], "y").body("hi").unique(false))?;
                m.threads().delete(tx, hard.thread.id, true)?;
                assert!(matches!(
                    m.threads().get(tx, hard.thread.id),
                    Err(CourierError::NotFound(_))
                ));
                let orphans: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM recipients WHERE thread_id = ?1",
                    params![hard.thread.id],
                    |r| r.get(0),
                )?;
                assert_eq!(orphans, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_older_than() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b, c] = seed_users(tx, ["a", "b", "c"])?;
                let old_open = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "1"))?.thread;
                let old_closed = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [c], "2").closed())?
                    .thread;
                let recent = m.threads().find_or_create(tx, ThreadRequest::new(b, [c], "3"))?.thread;

                let stale = ts(Utc::now() - Duration::days(40));
                tx.execute(
                    "UPDATE threads SET updated_at = ?1 WHERE id IN (?2, ?3)",
                    params![stale, old_open.id, old_closed.id],
                )?;

                assert_eq!(m.threads().delete_older_than(tx, 30, true, false)?, 1);
                assert!(m.threads().get(tx, old_closed.id)?.deleted);
                assert!(!m.threads().get(tx, old_open.id)?.deleted);

                assert_eq!(m.threads().delete_older_than(tx, 30, false, true)?, 2);
                assert!(m.threads().get(tx, old_open.id).is_err());
                assert!(!m.threads().get(tx, recent.id)?.deleted);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_check_access_and_inbox() {
        let m = messenger();
        m.store()
            .transaction(|tx| {
                let [a, b, c] = seed_users(tx, ["a", "b", "c"])?;
                let thread = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "x"))?.thread;

                assert!(m.threads().check_access(tx, thread.id, b).is_ok());
                let denied = m.threads().check_access(tx, thread.id, c).unwrap_err();
                assert!(denied.is_permission_denied());

                assert_eq!(m.threads().inbox(tx, b, false)?.len(), 1);
                assert!(m.threads().inbox(tx, c, true)?.is_empty());

                m.threads().add_participant(tx, thread.id, c, a)?;
                assert_eq!(m.threads().get(tx, thread.id)?.recipient_count, 3);
                assert_eq!(m.threads().inbox(tx, c, false)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unique_default_follows_config() {
        let mut config = CourierConfig::new();
        config.messaging.unique_threads = false;
        let m = messenger_with(config);
        m.store()
            .transaction(|tx| {
                let [a, b] = seed_users(tx, ["a", "b"])?;
                let first = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "x"))?;
                let second = m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "x"))?;
                assert_ne!(first.thread.id, second.thread.id);
                Ok(())
            })
            .unwrap();
    }
}
