//! Mail queue
//!
//! Persists notification events, merges repeats into one pending event per
//! (recipient, mail type, forced) and drains them in batches.
//!
//! A drain picks destinations in order of their earliest due event, skips
//! users whose own rate policy says "not yet", and stops after a per-run
//! ceiling of destinations. Events are marked sent inside the drain's
//! transaction before the transport sees them; a failed delivery is reported
//! and, unless the failure policy says otherwise, stays marked sent.

use super::event::{listify, merge_payload, MailEvent, MailEventId, MailPayload, MailRecipient};
use super::metrics;
use super::render::{render, Envelope};
use super::transport::MailTransport;
use super::types::MailTypeRegistry;
use crate::config::{FailurePolicy, MailQueueConfig};
use crate::events::{Event, EventHandler, Verdict};
use crate::messaging::UserId;
use crate::store::{days_before, parse_opt_ts, parse_ts, ts, users, Store, User};
use crate::{CourierError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Which events a drain looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Ordinary,
    Forced,
    /// Ordinary, then forced
    All,
}

impl ProcessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Ordinary => "ordinary",
            ProcessMode::Forced => "forced",
            ProcessMode::All => "all",
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessMode {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "false" | "ordinary" => Ok(ProcessMode::Ordinary),
            "true" | "forced" => Ok(ProcessMode::Forced),
            "all" | "both" => Ok(ProcessMode::All),
            other => Err(CourierError::InvalidArgument(format!(
                "unknown process mode '{}' (expected true, false or all)",
                other
            ))),
        }
    }
}

/// Outcome of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events handed to the transport successfully
    pub sent: usize,
    /// Events marked sent whose delivery failed
    pub failed: usize,
    /// Events dropped: opted-out or unresolvable recipients, unknown types
    pub discarded: usize,
    /// Destinations passed over because of their rate policy
    pub skipped: usize,
}

impl DrainReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.skipped += other.skipped;
    }
}

const EVENT_COLUMNS: &str = "e.id, e.mail_type, e.user_id, e.address, e.payload, e.forced, \
     e.sent, e.sent_at, e.discarded, e.minimum_time, e.created_at";

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<MailEvent> {
    let user_id: Option<UserId> = row.get(2)?;
    let address: Option<String> = row.get(3)?;
    let payload: String = row.get(4)?;
    let minimum_time: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    let payload: MailPayload = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let recipient = match user_id {
        Some(id) => MailRecipient::User(id),
        None => MailRecipient::Address(address.unwrap_or_default()),
    };

    Ok(MailEvent {
        id: row.get(0)?,
        mail_type: row.get(1)?,
        recipient,
        payload,
        forced: row.get(5)?,
        sent: row.get(6)?,
        sent_at: parse_opt_ts(row.get(7)?)?,
        discarded: row.get(8)?,
        minimum_time: parse_ts(&minimum_time)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn split_recipient(recipient: &MailRecipient) -> (Option<UserId>, Option<&str>) {
    match recipient {
        MailRecipient::User(id) => (Some(*id), None),
        MailRecipient::Address(address) => (None, Some(address.trim())),
    }
}

/// Persistent notification queue
pub struct MailQueue {
    registry: MailTypeRegistry,
    config: MailQueueConfig,
    transport: Arc<dyn MailTransport>,
}

impl MailQueue {
    pub fn new(
        registry: MailTypeRegistry,
        config: MailQueueConfig,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            registry,
            config,
            transport,
        }
    }

    pub fn registry(&self) -> &MailTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MailQueueConfig {
        &self.config
    }

    /// Queue a notification, merging into the pending event for the same slot
    ///
    /// A merge appends the new values and keeps the original earliest send time.
    pub fn enqueue(
        &self,
        conn: &Connection,
        recipient: &MailRecipient,
        mail_type: &str,
        data: &serde_json::Value,
        forced: bool,
    ) -> Result<MailEvent> {
        let kind = self.registry.get(mail_type)?;
        match recipient {
            MailRecipient::User(id) => {
                users::require_user(conn, *id)?;
            }
            MailRecipient::Address(address) if address.trim().is_empty() => {
                return Err(CourierError::InvalidArgument(
                    "mail address is empty".to_string(),
                ));
            }
            MailRecipient::Address(_) => {}
        }
        let incoming = listify(data)?;
        let now = Utc::now();
        let (user_id, address) = split_recipient(recipient);

        let inserted = conn.execute(
            "INSERT INTO mail_events (mail_type, user_id, address, recipient_key, payload, forced,
                                      minimum_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT DO NOTHING",
            params![
                mail_type,
                user_id,
                address,
                recipient.key(),
                serde_json::to_string(&incoming)?,
                forced,
                ts(now + kind.interval()),
                ts(now),
            ],
        )?;
        if inserted == 1 {
            metrics::record_enqueue(mail_type, false);
            let id = MailEventId(conn.last_insert_rowid());
            tracing::debug!(event_id = %id, mail_type, recipient = %recipient, forced, "Queued mail event");
            return self.require(conn, id);
        }

        let mut event = self
            .find_pending(conn, recipient, mail_type, forced)?
            .ok_or_else(|| {
                CourierError::Storage("pending mail event vanished during merge".to_string())
            })?;
        merge_payload(&mut event.payload, incoming);
        conn.execute(
            "UPDATE mail_events SET payload = ?2 WHERE id = ?1",
            params![event.id, serde_json::to_string(&event.payload)?],
        )?;
        metrics::record_enqueue(mail_type, true);
        tracing::debug!(event_id = %event.id, mail_type, recipient = %recipient, "Merged into pending mail event");
        Ok(event)
    }

    pub fn get(&self, conn: &Connection, id: MailEventId) -> Result<Option<MailEvent>> {
        let sql = format!("SELECT {} FROM mail_events e WHERE e.id = ?1", EVENT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_event).optional()?)
    }

    fn require(&self, conn: &Connection, id: MailEventId) -> Result<MailEvent> {
        self.get(conn, id)?
            .ok_or_else(|| CourierError::not_found("mail event", id))
    }

    /// The unsent event occupying a (recipient, mail type, forced) slot
    pub fn find_pending(
        &self,
        conn: &Connection,
        recipient: &MailRecipient,
        mail_type: &str,
        forced: bool,
    ) -> Result<Option<MailEvent>> {
        let sql = format!(
            "SELECT {} FROM mail_events e
             WHERE e.recipient_key = ?1 AND e.mail_type = ?2 AND e.forced = ?3
               AND e.sent = 0 AND e.discarded = 0",
            EVENT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![recipient.key(), mail_type, forced], row_to_event)
            .optional()?)
    }

    /// Every unsent, non-discarded event, oldest first
    pub fn pending(&self, conn: &Connection) -> Result<Vec<MailEvent>> {
        let sql = format!(
            "SELECT {} FROM mail_events e WHERE e.sent = 0 AND e.discarded = 0 ORDER BY e.id",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map([], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Number of unsent, non-discarded events, optionally of one forced value
    pub fn depth(&self, conn: &Connection, forced: Option<bool>) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mail_events
             WHERE sent = 0 AND discarded = 0 AND (?1 IS NULL OR forced = ?1)",
            params![forced],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Pending event counts per mail type
    pub fn pending_by_type(&self, conn: &Connection) -> Result<Vec<(String, usize)>> {
        let mut stmt = conn.prepare(
            "SELECT mail_type, COUNT(*) FROM mail_events
             WHERE sent = 0 AND discarded = 0 GROUP BY mail_type ORDER BY mail_type",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Non-forced pending events of `user`, which become moot once the user is on the site
    pub fn discardable(&self, conn: &Connection, user: UserId) -> Result<Vec<MailEvent>> {
        let sql = format!(
            "SELECT {} FROM mail_events e
             WHERE e.user_id = ?1 AND e.forced = 0 AND e.sent = 0 AND e.discarded = 0
             ORDER BY e.id",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![user], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Discard [`discardable`](Self::discardable) events; returns how many
    pub fn discard(&self, conn: &Connection, user: UserId) -> Result<usize> {
        let discarded = conn.execute(
            "UPDATE mail_events SET discarded = 1
             WHERE user_id = ?1 AND forced = 0 AND sent = 0 AND discarded = 0",
            params![user],
        )?;
        if discarded > 0 {
            tracing::debug!(user_id = %user, discarded, "Discarded mail for present user");
        }
        Ok(discarded)
    }

    /// Delete sent and discarded events created more than `days` ago
    pub fn purge(&self, conn: &Connection, days: u32) -> Result<usize> {
        let cutoff = days_before(Utc::now(), days)?;
        let purged = conn.execute(
            "DELETE FROM mail_events WHERE (sent = 1 OR discarded = 1) AND created_at < ?1",
            params![ts(cutoff)],
        )?;
        Ok(purged)
    }

    /// Drain the queue
    ///
    /// `bypass_delay` ignores both the events' earliest send times and the
    /// recipients' rate policy.
    pub fn process(&self, store: &Store, mode: ProcessMode, bypass_delay: bool) -> Result<DrainReport> {
        match mode {
            ProcessMode::Ordinary => self.process_batch(store, false, bypass_delay),
            ProcessMode::Forced => self.process_batch(store, true, bypass_delay),
            ProcessMode::All => {
                let mut report = self.process_batch(store, false, bypass_delay)?;
                report += self.process_batch(store, true, bypass_delay)?;
                Ok(report)
            }
        }
    }

    fn process_batch(&self, store: &Store, forced: bool, bypass_delay: bool) -> Result<DrainReport> {
        let started = Instant::now();
        let mode = if forced { ProcessMode::Forced } else { ProcessMode::Ordinary };
        let mut report = DrainReport::default();

        let outbox = store.transaction(|tx| self.select_and_mark(tx, forced, bypass_delay, &mut report))?;

        let mut failed = Vec::new();
        for envelope in &outbox {
            match self.transport.deliver(envelope) {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        to = %envelope.to,
                        transport = self.transport.name(),
                        error = %err,
                        "Mail delivery failed"
                    );
                    report.failed += 1;
                    failed.push(envelope.event_id);
                }
            }
        }

        if !failed.is_empty() && self.config.failure_policy == FailurePolicy::Requeue {
            store.transaction(|tx| {
                for id in &failed {
                    self.requeue(tx, *id)?;
                }
                Ok(())
            })?;
        }

        metrics::record_processed("sent", report.sent);
        metrics::record_processed("failed", report.failed);
        metrics::record_processed("discarded", report.discarded);
        metrics::record_processed("skipped", report.skipped);
        metrics::record_drain_duration(mode.as_str(), started.elapsed().as_secs_f64());

        if outbox.is_empty() && report.discarded == 0 {
            tracing::debug!(mode = %mode, skipped = report.skipped, "Nothing to send");
        } else {
            tracing::info!(
                mode = %mode,
                sent = report.sent,
                failed = report.failed,
                discarded = report.discarded,
                skipped = report.skipped,
                "Drained mail queue"
            );
        }
        Ok(report)
    }

    /// Pick destinations, mark their events sent and render them
    fn select_and_mark(
        &self,
        conn: &Connection,
        forced: bool,
        bypass_delay: bool,
        report: &mut DrainReport,
    ) -> Result<Vec<Envelope>> {
        let depth = self.depth(conn, None)?;
        metrics::set_queue_depth(depth);
        if depth == 0 {
            return Ok(Vec::new());
        }

        report.discarded += self.discard_orphans(conn)?;

        let ceiling = self.config.ceiling_for(self.depth(conn, Some(forced))?);
        let now = Utc::now();
        let mut processed = 0;
        let mut outbox = Vec::new();

        for destination in self.destinations(conn, forced)? {
            if processed >= ceiling {
                break;
            }
            let events = self.events_for(conn, &destination, forced)?;
            let user = self.resolve_user(conn, &destination, &events)?;

            if let Some(user) = &user {
                if !forced && user.mail_opt_out {
                    for event in &events {
                        self.mark_discarded(conn, event.id)?;
                    }
                    report.discarded += events.len();
                    continue;
                }
                if !forced && !bypass_delay && !user.can_receive_at(now) {
                    report.skipped += 1;
                    continue;
                }
            }
            processed += 1;

            let recipient_name = user
                .as_ref()
                .map_or_else(|| destination.clone(), |u| u.username.clone());
            let mut mailed = false;
            for event in &events {
                if !bypass_delay && !event.is_due_at(now) {
                    continue;
                }
                let Ok(kind) = self.registry.get(&event.mail_type) else {
                    tracing::warn!(event_id = %event.id, mail_type = %event.mail_type, "Discarding event of unknown mail type");
                    self.mark_discarded(conn, event.id)?;
                    report.discarded += 1;
                    continue;
                };
                conn.execute(
                    "UPDATE mail_events SET sent = 1, sent_at = ?2 WHERE id = ?1",
                    params![event.id, ts(now)],
                )?;
                outbox.push(render(kind, event, &destination, &recipient_name));
                mailed = true;
            }

            if mailed {
                if let Some(user) = &user {
                    users::mark_mailed(conn, user.id, now)?;
                }
            }
        }

        Ok(outbox)
    }

    /// Discard events nobody can receive: unknown users, users without an
    /// address and blank addresses
    fn discard_orphans(&self, conn: &Connection) -> Result<usize> {
        let discarded = conn.execute(
            "UPDATE mail_events SET discarded = 1
             WHERE sent = 0 AND discarded = 0 AND (
                 (user_id IS NOT NULL AND NOT EXISTS (
                     SELECT 1 FROM users u
                     WHERE u.id = mail_events.user_id AND u.email IS NOT NULL AND u.email <> ''))
                 OR (user_id IS NULL AND (address IS NULL OR address = '')))",
            [],
        )?;
        if discarded > 0 {
            tracing::info!(discarded, "Discarded mail events without a resolvable recipient");
        }
        Ok(discarded)
    }

    /// Destination addresses with pending events, earliest due first
    fn destinations(&self, conn: &Connection, forced: bool) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT COALESCE(u.email, e.address) AS destination, MIN(e.minimum_time) AS first_due
             FROM mail_events e LEFT JOIN users u ON u.id = e.user_id
             WHERE e.sent = 0 AND e.discarded = 0 AND e.forced = ?1
               AND COALESCE(u.email, e.address) IS NOT NULL
             GROUP BY destination
             ORDER BY first_due, destination",
        )?;
        let rows = stmt
            .query_map(params![forced], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn events_for(&self, conn: &Connection, destination: &str, forced: bool) -> Result<Vec<MailEvent>> {
        let sql = format!(
            "SELECT {} FROM mail_events e LEFT JOIN users u ON u.id = e.user_id
             WHERE e.sent = 0 AND e.discarded = 0 AND e.forced = ?1
               AND COALESCE(u.email, e.address) = ?2
             ORDER BY e.minimum_time, e.id",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![forced, destination], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn resolve_user(
        &self,
        conn: &Connection,
        destination: &str,
        events: &[MailEvent],
    ) -> Result<Option<User>> {
        let by_id = events.iter().find_map(|event| match event.recipient {
            MailRecipient::User(id) => Some(id),
            MailRecipient::Address(_) => None,
        });
        match by_id {
            Some(id) => users::get_user(conn, id),
            None => users::find_by_email(conn, destination),
        }
    }

    fn mark_discarded(&self, conn: &Connection, id: MailEventId) -> Result<()> {
        conn.execute(
            "UPDATE mail_events SET discarded = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Put a failed event back in the queue
    ///
    /// When a newer pending event already holds the slot, the failed payload is
    /// merged into it instead.
    fn requeue(&self, conn: &Connection, id: MailEventId) -> Result<()> {
        let changed = conn.execute(
            "UPDATE OR IGNORE mail_events SET sent = 0, sent_at = NULL WHERE id = ?1",
            params![id],
        )?;
        if changed > 0 {
            tracing::debug!(event_id = %id, "Requeued failed mail event");
            return Ok(());
        }

        let failed = self.require(conn, id)?;
        if let Some(mut pending) =
            self.find_pending(conn, &failed.recipient, &failed.mail_type, failed.forced)?
        {
            let mut payload = failed.payload;
            merge_payload(&mut payload, pending.payload);
            pending.payload = payload;
            conn.execute(
                "UPDATE mail_events SET payload = ?2, minimum_time = MIN(minimum_time, ?3) WHERE id = ?1",
                params![pending.id, serde_json::to_string(&pending.payload)?, ts(failed.minimum_time)],
            )?;
            tracing::debug!(event_id = %id, into = %pending.id, "Merged failed mail event into pending one");
        }
        Ok(())
    }

    /// Earliest due time among pending events
    pub fn next_due(&self, conn: &Connection) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = conn.query_row(
            "SELECT MIN(minimum_time) FROM mail_events WHERE sent = 0 AND discarded = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(parse_opt_ts(value)?)
    }
}

impl fmt::Debug for MailQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailQueue")
            .field("types", &self.registry.len())
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Enqueues every `mailable_event` published on the bus
#[derive(Debug, Clone)]
pub struct MailDispatch {
    queue: Arc<MailQueue>,
}

impl MailDispatch {
    pub fn new(queue: Arc<MailQueue>) -> Self {
        Self { queue }
    }
}

impl EventHandler for MailDispatch {
    fn name(&self) -> &'static str {
        "mail_dispatch"
    }

    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict> {
        if let Event::Mailable {
            mail_type,
            recipient,
            data,
            forced,
        } = event
        {
            self.queue.enqueue(conn, recipient, mail_type, data, *forced)?;
        }
        Ok(Verdict::Accept)
    }
}
