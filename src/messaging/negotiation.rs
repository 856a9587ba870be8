//! Contact negotiation
//!
//! A negotiation is a consent handshake: `source` asks `target` for permission
//! to talk. Acceptance opens a thread between the two; denial is final. When
//! negotiation is required, non-staff users may only start threads with people
//! who accepted (or sent them an accepted request).

use super::threads::{self, ThreadRegistry, ThreadRequest};
use super::types::{Negotiation, NegotiationStatus, Thread, UserId};
use super::QuotaEnforcer;
use crate::config::MessagingConfig;
use crate::events::{Event, EventBus, EventHandler, Verdict};
use crate::mail::MailRecipient;
use crate::store::{parse_ts, ts, users, Privilege};
use crate::{CourierError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::sync::Arc;

/// Mail type queued for the target of a new negotiation
pub const NEGOTIATION_MAIL: &str = "messaging.negotiation.new";

/// Mail type queued for the requester when the target accepts
pub const NEGOTIATION_ACCEPTED_MAIL: &str = "messaging.negotiation.accepted";

/// Result of [`Negotiations::negotiate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// A new request was recorded (and possibly auto-accepted)
    Sent(Negotiation),
    /// The pair already had a negotiation in this direction
    Existing(Negotiation),
    /// The requester used up today's negotiations
    QuotaExceeded,
}

const NEGOTIATION_COLUMNS: &str =
    "id, source_id, target_id, status, closed, thread_id, created_at, updated_at";

fn row_to_negotiation(row: &rusqlite::Row) -> rusqlite::Result<Negotiation> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Negotiation {
        id: row.get(0)?,
        source: row.get(1)?,
        target: row.get(2)?,
        status: row.get(3)?,
        closed: row.get(4)?,
        thread: row.get(5)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Whether `a` and `b` have an accepted negotiation in either direction
pub fn has_accepted(conn: &Connection, a: UserId, b: UserId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM negotiations
             WHERE status = 'accepted'
               AND ((source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1))
             LIMIT 1",
            params![a, b],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[derive(Clone)]
pub struct Negotiations {
    config: MessagingConfig,
    bus: Arc<EventBus>,
    threads: ThreadRegistry,
    quota: QuotaEnforcer,
}

impl Negotiations {
    pub fn new(
        config: MessagingConfig,
        bus: Arc<EventBus>,
        threads: ThreadRegistry,
        quota: QuotaEnforcer,
    ) -> Self {
        Self {
            config,
            bus,
            threads,
            quota,
        }
    }

    /// Negotiation from `source` to `target`, if any
    pub fn get(&self, conn: &Connection, source: UserId, target: UserId) -> Result<Option<Negotiation>> {
        let sql = format!(
            "SELECT {} FROM negotiations WHERE source_id = ?1 AND target_id = ?2",
            NEGOTIATION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![source, target], row_to_negotiation)
            .optional()?)
    }

    /// Requests waiting for `user` to answer
    pub fn pending_for(&self, conn: &Connection, user: UserId) -> Result<Vec<Negotiation>> {
        let sql = format!(
            "SELECT {} FROM negotiations WHERE target_id = ?1 AND status = 'pending' ORDER BY id",
            NEGOTIATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user], row_to_negotiation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ask `target` for permission to talk
    ///
    /// An existing negotiation for the pair is returned as is. Requesters
    /// holding [`Privilege::NegotiationBypass`] are accepted on the spot.
    pub fn negotiate(&self, conn: &Connection, source: UserId, target: UserId) -> Result<NegotiationOutcome> {
        if source == target {
            return Err(CourierError::InvalidArgument(
                "cannot negotiate with yourself".to_string(),
            ));
        }
        let requester = users::require_user(conn, source)?;
        users::require_user(conn, target)?;

        if let Some(existing) = self.get(conn, source, target)? {
            return Ok(NegotiationOutcome::Existing(existing));
        }
        if self.config.blacklist_enabled && users::is_blocked(conn, target, source)? {
            return Err(CourierError::PermissionDenied(format!(
                "user {} does not accept contact requests from user {}",
                target, source
            )));
        }
        if self.quota.exceeded_negotiations(conn, &requester)? {
            tracing::info!(user_id = %source, "Negotiation quota exceeded");
            return Ok(NegotiationOutcome::QuotaExceeded);
        }

        let now = ts(Utc::now());
        let inserted = conn.execute(
            "INSERT INTO negotiations (source_id, target_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(source_id, target_id) DO NOTHING",
            params![source, target, now],
        )?;
        let negotiation = self
            .get(conn, source, target)?
            .ok_or_else(|| CourierError::Storage("negotiation vanished after insert".to_string()))?;
        if inserted == 0 {
            return Ok(NegotiationOutcome::Existing(negotiation));
        }

        self.bus
            .notify(conn, &Event::NegotiationSent { source, target })?;

        if requester.has_privilege(Privilege::NegotiationBypass) {
            self.accept(conn, target, source)?;
            let accepted = self
                .get(conn, source, target)?
                .ok_or_else(|| CourierError::not_found("negotiation", negotiation.id))?;
            return Ok(NegotiationOutcome::Sent(accepted));
        }

        self.bus.notify(
            conn,
            &Event::Mailable {
                mail_type: NEGOTIATION_MAIL.to_string(),
                recipient: MailRecipient::User(target),
                data: json!({ "sender": requester.username }),
                forced: false,
            },
        )?;
        tracing::info!(source = %source, target = %target, "Negotiation sent");
        Ok(NegotiationOutcome::Sent(negotiation))
    }

    /// `acceptor` accepts the request `requester` sent them
    ///
    /// Opens a thread between the two with a system message. Returns `None`
    /// when the negotiation was already answered.
    pub fn accept(&self, conn: &Connection, acceptor: UserId, requester: UserId) -> Result<Option<Thread>> {
        let negotiation = self
            .get(conn, requester, acceptor)?
            .ok_or_else(|| CourierError::NotFound(format!(
                "negotiation from user {} to user {}",
                requester, acceptor
            )))?;
        if negotiation.status.is_terminal() {
            tracing::debug!(negotiation_id = %negotiation.id, status = negotiation.status.as_str(), "Already answered");
            return Ok(None);
        }

        let requester_name = users::username(conn, requester)?.unwrap_or_else(|| requester.to_string());
        let acceptor_name = users::username(conn, acceptor)?.unwrap_or_else(|| acceptor.to_string());

        let thread = self
            .threads
            .find_or_create(
                conn,
                ThreadRequest::new(
                    requester,
                    [acceptor],
                    format!("{} and {}", requester_name, acceptor_name),
                )
                .unique(false)
                .force(),
            )?
            .thread;
        self.threads.appender().append(
            conn,
            None,
            thread.id,
            &format!("{} accepted the contact request from {}.", acceptor_name, requester_name),
        )?;
        if self.config.negotiation_thread_closed {
            threads::write_closed(conn, thread.id, true)?;
        }

        conn.execute(
            "UPDATE negotiations SET status = ?2, closed = 1, thread_id = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![negotiation.id, NegotiationStatus::Accepted, thread.id, ts(Utc::now())],
        )?;

        self.bus.notify(
            conn,
            &Event::NegotiationAccepted {
                source: requester,
                target: acceptor,
            },
        )?;
        self.bus.notify(
            conn,
            &Event::Mailable {
                mail_type: NEGOTIATION_ACCEPTED_MAIL.to_string(),
                recipient: MailRecipient::User(requester),
                data: json!({ "sender": acceptor_name, "thread": thread.id }),
                forced: false,
            },
        )?;

        Ok(Some(threads::require(conn, thread.id)?))
    }

    /// `denier` refuses the request `requester` sent them
    ///
    /// Returns false when the negotiation was already answered.
    pub fn deny(&self, conn: &Connection, denier: UserId, requester: UserId) -> Result<bool> {
        let negotiation = self
            .get(conn, requester, denier)?
            .ok_or_else(|| CourierError::NotFound(format!(
                "negotiation from user {} to user {}",
                requester, denier
            )))?;
        if negotiation.status.is_terminal() {
            return Ok(false);
        }

        conn.execute(
            "UPDATE negotiations SET status = ?2, closed = 1, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![negotiation.id, NegotiationStatus::Denied, ts(Utc::now())],
        )?;
        self.bus.notify(
            conn,
            &Event::NegotiationDenied {
                source: requester,
                target: denier,
            },
        )?;
        Ok(true)
    }
}

/// Vetoes `thread.pre_create` between users without an accepted negotiation
#[derive(Debug, Default)]
pub struct NegotiationGuard;

impl EventHandler for NegotiationGuard {
    fn name(&self) -> &'static str {
        "negotiation"
    }

    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict> {
        let Event::ThreadPreCreate {
            author,
            recipients,
            force,
            ..
        } = event
        else {
            return Ok(Verdict::Accept);
        };
        if *force || users::require_user(conn, *author)?.is_privileged() {
            return Ok(Verdict::Accept);
        }

        let mut reasons = Vec::new();
        for recipient in recipients.iter().filter(|r| *r != author) {
            if !has_accepted(conn, *author, *recipient)? {
                reasons.push(format!(
                    "user {} has not accepted a contact request from you",
                    recipient
                ));
            }
        }
        Ok(Verdict::from_reasons(reasons))
    }
}
