//! Audit trail for fire-and-forget events

use super::{Event, EventHandler, EventKind, Verdict};
use crate::Result;
use rusqlite::Connection;

/// Logs every notification event at info level
#[derive(Debug, Default)]
pub struct AuditLog;

impl AuditLog {
    /// Event kinds the audit log subscribes to
    pub const KINDS: [EventKind; 5] = [
        EventKind::ThreadCreated,
        EventKind::MessageSent,
        EventKind::NegotiationSent,
        EventKind::NegotiationAccepted,
        EventKind::NegotiationDenied,
    ];
}

impl EventHandler for AuditLog {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn handle(&self, _conn: &Connection, event: &Event) -> Result<Verdict> {
        match event {
            Event::ThreadCreated { author, thread } => {
                tracing::info!(event = "thread.created", thread_id = %thread, author = ?author);
            }
            Event::MessageSent {
                author,
                thread,
                message,
            } => {
                tracing::info!(
                    event = "message.sent",
                    thread_id = %thread,
                    message_id = %message,
                    author = ?author
                );
            }
            Event::NegotiationSent { source, target }
            | Event::NegotiationAccepted { source, target }
            | Event::NegotiationDenied { source, target } => {
                tracing::info!(
                    event = event.kind().as_str(),
                    source = %source,
                    target = %target
                );
            }
            other => {
                tracing::debug!(event = other.kind().as_str(), "audit");
            }
        }
        Ok(Verdict::Accept)
    }
}
