//! In-process event bus
//!
//! Components publish typed [`Event`]s; subscribed [`EventHandler`]s run
//! synchronously, in subscription order, on the publisher's connection. That
//! puts every handler inside the publisher's transaction: a handler error rolls
//! the whole operation back.
//!
//! Handlers answer with a [`Verdict`]. For the `pre_*` events a rejection vetoes
//! the operation; for the others it is logged and ignored.
//!
//! The bus is assembled once with [`EventBusBuilder`] during application wiring
//! and is immutable afterwards.

pub mod audit;

pub use audit::AuditLog;

use crate::mail::MailRecipient;
use crate::messaging::{MessageId, ThreadId, UserId};
use crate::Result;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Event names, as used in logs and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ThreadPreCreate,
    ThreadCreated,
    ThreadRead,
    MessagePreSend,
    MessageSent,
    Mailable,
    NegotiationSent,
    NegotiationAccepted,
    NegotiationDenied,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ThreadPreCreate => "thread.pre_create",
            EventKind::ThreadCreated => "thread.created",
            EventKind::ThreadRead => "thread.read",
            EventKind::MessagePreSend => "message.pre_send",
            EventKind::MessageSent => "message.sent",
            EventKind::Mailable => "mailable_event",
            EventKind::NegotiationSent => "negotiation.sent",
            EventKind::NegotiationAccepted => "negotiation.accepted",
            EventKind::NegotiationDenied => "negotiation.denied",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ThreadPreCreate {
        author: UserId,
        recipients: BTreeSet<UserId>,
        unique: bool,
        force: bool,
    },
    ThreadCreated {
        author: Option<UserId>,
        thread: ThreadId,
    },
    ThreadRead {
        user: UserId,
        thread: ThreadId,
    },
    MessagePreSend {
        author: Option<UserId>,
        thread: ThreadId,
    },
    MessageSent {
        author: Option<UserId>,
        thread: ThreadId,
        message: MessageId,
    },
    Mailable {
        mail_type: String,
        recipient: MailRecipient,
        data: serde_json::Value,
        forced: bool,
    },
    NegotiationSent {
        source: UserId,
        target: UserId,
    },
    NegotiationAccepted {
        source: UserId,
        target: UserId,
    },
    NegotiationDenied {
        source: UserId,
        target: UserId,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ThreadPreCreate { .. } => EventKind::ThreadPreCreate,
            Event::ThreadCreated { .. } => EventKind::ThreadCreated,
            Event::ThreadRead { .. } => EventKind::ThreadRead,
            Event::MessagePreSend { .. } => EventKind::MessagePreSend,
            Event::MessageSent { .. } => EventKind::MessageSent,
            Event::Mailable { .. } => EventKind::Mailable,
            Event::NegotiationSent { .. } => EventKind::NegotiationSent,
            Event::NegotiationAccepted { .. } => EventKind::NegotiationAccepted,
            Event::NegotiationDenied { .. } => EventKind::NegotiationDenied,
        }
    }
}

/// A handler's answer to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Human-readable reasons, never empty
    Reject(Vec<String>),
}

impl Verdict {
    /// Reject with a single reason
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Reject(vec![reason.into()])
    }

    /// Accept when `reasons` is empty, reject otherwise
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Reject(reasons)
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Trait for event subscribers
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// React to `event`; errors abort the publisher's transaction
    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict>;
}

/// Collects subscriptions before the bus is frozen
#[derive(Default)]
pub struct EventBusBuilder {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    /// Subscribe one handler to several kinds
    pub fn subscribe_all(mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> Self {
        for kind in kinds {
            self = self.subscribe(*kind, Arc::clone(&handler));
        }
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            handlers: self.handlers,
        }
    }
}

/// Synchronous publish/subscribe registry
pub struct EventBus {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// A bus with no subscribers
    pub fn empty() -> Self {
        EventBusBuilder::new().build()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every subscriber and collect rejection reasons
    ///
    /// All handlers run even after a rejection so the caller sees every reason.
    pub fn publish(&self, conn: &Connection, event: &Event) -> Result<Vec<String>> {
        let kind = event.kind();
        let mut reasons = Vec::new();

        for handler in self.handlers.get(&kind).into_iter().flatten() {
            match handler.handle(conn, event)? {
                Verdict::Accept => {}
                Verdict::Reject(mut handler_reasons) => {
                    tracing::debug!(
                        event = %kind,
                        handler = handler.name(),
                        reasons = ?handler_reasons,
                        "Handler rejected event"
                    );
                    reasons.append(&mut handler_reasons);
                }
            }
        }

        Ok(reasons)
    }

    /// Fire-and-forget delivery; rejections are logged and ignored
    pub fn notify(&self, conn: &Connection, event: &Event) -> Result<()> {
        let reasons = self.publish(conn, event)?;
        if !reasons.is_empty() {
            tracing::warn!(
                event = %event.kind(),
                reasons = ?reasons,
                "Ignoring rejection of a notification event"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        kinds.sort();
        f.debug_struct("EventBus").field("handlers", &kinds).finish()
    }
}
