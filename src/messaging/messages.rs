//! Message appender
//!
//! Posts messages into threads, keeps the denormalized counters in step and
//! fans the new-message notification out to the other participants.

use super::recipients::{active_participants, RecipientTracker};
use super::threads;
use super::types::{Message, MessageId, Thread, ThreadId, UserId};
use crate::events::{Event, EventBus};
use crate::mail::MailRecipient;
use crate::store::{parse_ts, ts, users};
use crate::{CourierError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::sync::Arc;

/// Mail type queued for every recipient of a new message
pub const NEW_MESSAGE_MAIL: &str = "messaging.message.new";

const MESSAGE_COLUMNS: &str = "id, thread_id, author_id, body, created_at, deleted, spam_score";

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let created_at: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        thread: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: parse_ts(&created_at)?,
        deleted: row.get(5)?,
        spam_score: row.get(6)?,
    })
}

#[derive(Debug, Clone)]
pub struct MessageAppender {
    bus: Arc<EventBus>,
    recipients: RecipientTracker,
    blacklist_enabled: bool,
}

impl MessageAppender {
    pub fn new(bus: Arc<EventBus>, recipients: RecipientTracker, blacklist_enabled: bool) -> Self {
        Self {
            bus,
            recipients,
            blacklist_enabled,
        }
    }

    fn check(&self, conn: &Connection, author: Option<UserId>, thread: ThreadId) -> Result<Thread> {
        let thread = threads::require(conn, thread)?;
        if thread.deleted {
            return Err(CourierError::not_found("thread", thread.id));
        }
        if thread.is_expired_at(Utc::now()) {
            return Err(CourierError::PermissionDenied(format!(
                "thread {} has expired",
                thread.id
            )));
        }

        if let Some(author) = author {
            let user = users::require_user(conn, author)?;
            if !user.is_privileged() {
                let active = self
                    .recipients
                    .get(conn, thread.id, author)?
                    .is_some_and(|r| r.active);
                if !active {
                    return Err(CourierError::PermissionDenied(format!(
                        "user {} is not a participant of thread {}",
                        author, thread.id
                    )));
                }
                if thread.closed {
                    return Err(CourierError::PermissionDenied(format!(
                        "thread {} is closed",
                        thread.id
                    )));
                }
            }
        }

        let reasons = self.bus.publish(
            conn,
            &Event::MessagePreSend {
                author,
                thread: thread.id,
            },
        )?;
        if !reasons.is_empty() {
            return Err(CourierError::PermissionDenied(reasons.join("; ")));
        }
        Ok(thread)
    }

    /// Whether `author` may post to `thread` right now
    pub fn can_post(&self, conn: &Connection, author: Option<UserId>, thread: ThreadId) -> Result<bool> {
        match self.check(conn, author, thread) {
            Ok(_) => Ok(true),
            Err(CourierError::PermissionDenied(_)) | Err(CourierError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Post a message; `author` is `None` for system messages
    ///
    /// Staff may post to closed threads they are not part of. Everyone else
    /// must be an active recipient of an open thread.
    pub fn append(
        &self,
        conn: &Connection,
        author: Option<UserId>,
        thread: ThreadId,
        body: &str,
    ) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(CourierError::InvalidArgument(
                "message body is empty".to_string(),
            ));
        }
        let thread = self.check(conn, author, thread)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages (thread_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![thread.id, author, body, ts(now)],
        )?;
        let message = Message {
            id: MessageId(conn.last_insert_rowid()),
            thread: thread.id,
            author,
            body: body.to_string(),
            created_at: now,
            deleted: false,
            spam_score: None,
        };

        conn.execute(
            "UPDATE threads SET updated_at = ?2, last_updater_id = ?3 WHERE id = ?1",
            params![thread.id, ts(now), author],
        )?;
        threads::refresh_counters(conn, thread.id)?;
        self.recipients.set_unread_by_message(conn, &message)?;

        self.bus.notify(
            conn,
            &Event::MessageSent {
                author,
                thread: thread.id,
                message: message.id,
            },
        )?;
        let notified = self.fan_out(conn, &thread, &message)?;

        tracing::debug!(
            thread_id = %thread.id,
            message_id = %message.id,
            notified,
            "Appended message"
        );
        Ok(message)
    }

    /// Queue the new-message mail for each other participant
    ///
    /// Recipients who block the author are skipped.
    fn fan_out(&self, conn: &Connection, thread: &Thread, message: &Message) -> Result<usize> {
        let sender = match message.author {
            Some(author) => users::username(conn, author)?.unwrap_or_else(|| author.to_string()),
            None => "system".to_string(),
        };

        let mut notified = 0;
        for user in active_participants(conn, thread.id)? {
            if Some(user) == message.author {
                continue;
            }
            if let Some(author) = message.author {
                if self.blacklist_enabled && users::is_blocked(conn, user, author)? {
                    tracing::debug!(user_id = %user, author = %author, "Recipient blocks author; no mail");
                    continue;
                }
            }
            self.bus.notify(
                conn,
                &Event::Mailable {
                    mail_type: NEW_MESSAGE_MAIL.to_string(),
                    recipient: MailRecipient::User(user),
                    data: json!({
                        "sender": sender,
                        "message": message.body,
                        "thread": thread.id,
                        "topic": thread.topic,
                    }),
                    forced: false,
                },
            )?;
            notified += 1;
        }
        Ok(notified)
    }

    pub fn get(&self, conn: &Connection, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_message).optional()?)
    }

    fn require(&self, conn: &Connection, id: MessageId) -> Result<Message> {
        self.get(conn, id)?
            .ok_or_else(|| CourierError::not_found("message", id))
    }

    /// Messages of a thread in posting order
    pub fn list(&self, conn: &Connection, thread: ThreadId, include_deleted: bool) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE thread_id = ?1 AND (?2 OR deleted = 0) ORDER BY id",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params![thread, include_deleted], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn set_deleted(&self, conn: &Connection, id: MessageId, actor: UserId, deleted: bool) -> Result<Message> {
        let message = self.require(conn, id)?;
        let user = users::require_user(conn, actor)?;
        if !user.is_privileged() && message.author != Some(actor) {
            return Err(CourierError::PermissionDenied(format!(
                "user {} may not modify message {}",
                actor, id
            )));
        }
        conn.execute(
            "UPDATE messages SET deleted = ?2 WHERE id = ?1",
            params![id, deleted],
        )?;
        threads::refresh_counters(conn, message.thread)?;
        self.require(conn, id)
    }

    /// Soft delete a message; its author or staff only
    pub fn delete_message(&self, conn: &Connection, id: MessageId, actor: UserId) -> Result<Message> {
        self.set_deleted(conn, id, actor, true)
    }

    pub fn undelete_message(&self, conn: &Connection, id: MessageId, actor: UserId) -> Result<Message> {
        self.set_deleted(conn, id, actor, false)
    }

    /// Store the score computed by an external spam classifier
    pub fn set_spam_score(&self, conn: &Connection, id: MessageId, score: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(CourierError::InvalidArgument(format!(
                "spam score {} is outside 0..=1",
                score
            )));
        }
        let changed = conn.execute(
            "UPDATE messages SET spam_score = ?2 WHERE id = ?1",
            params![id, score],
        )?;
        if changed == 0 {
            return Err(CourierError::not_found("message", id));
        }
        Ok(())
    }
}
