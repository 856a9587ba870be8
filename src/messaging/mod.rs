//! Conversation engine
//!
//! Threads between users, their messages and per-user read state, plus the
//! guards that decide who may talk to whom: daily quotas, the blocklist and
//! contact negotiations.

pub mod contact;
pub mod messages;
pub mod negotiation;
pub mod quota;
pub mod recipients;
pub mod threads;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use contact::{can_contact, BlocklistGuard};
pub use messages::{MessageAppender, NEW_MESSAGE_MAIL};
pub use negotiation::{
    has_accepted, NegotiationGuard, NegotiationOutcome, Negotiations, NEGOTIATION_ACCEPTED_MAIL,
    NEGOTIATION_MAIL,
};
pub use quota::{QuotaEnforcer, QuotaGuard, QuotaLimits};
pub use recipients::{DisableEffect, ReadReceipt, RecipientTracker};
pub use threads::{ThreadOutcome, ThreadRegistry, ThreadRequest};
pub use types::{
    Closeable, ContentKind, ContentLoader, ContentRef, ContentRegistry, HasParticipants, Message,
    MessageId, Negotiation, NegotiationId, NegotiationStatus, Recipient, Thread, ThreadId, UserId,
};
