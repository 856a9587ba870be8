//! Notification mail
//!
//! Mail types, the persistent queue of pending notifications, rendering,
//! delivery transports and the periodic drain scheduler.
//!
//! Components never send mail directly. They publish a `mailable_event` on the
//! event bus; [`MailDispatch`] turns it into a queued [`MailEvent`], and a
//! later drain renders and delivers it.

pub mod event;
pub mod metrics;
pub mod queue;
pub mod render;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use event::{listify, merge_payload, MailEvent, MailEventId, MailPayload, MailRecipient};
pub use queue::{DrainReport, MailDispatch, MailQueue, ProcessMode};
pub use render::{render, Envelope};
pub use scheduler::{MailScheduler, SchedulerCommand, SchedulerStats};
pub use transport::{
    from_config as transport_from_config, LogTransport, MailTransport, MemoryTransport,
    SpoolTransport, TransportError,
};
pub use types::{MailCategory, MailType, MailTypeRegistry};
