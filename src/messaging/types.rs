//! Conversation data model
//!
//! Threads, recipients, messages and negotiations, plus the capability traits
//! shared by entities that have participants or can be closed.

use crate::{CourierError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.0))
            }
        }

        impl ::rusqlite::types::FromSql for $name {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                <i64 as ::rusqlite::types::FromSql>::column_result(value).map($name)
            }
        }
    };
}

pub(crate) use id_type;

id_type!(
    /// Identifier of a user in the directory
    UserId
);
id_type!(ThreadId);
id_type!(MessageId);
id_type!(NegotiationId);

/// A conversation grouping a set of participants
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    /// `None` for threads opened by the system
    pub author: Option<UserId>,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_updater: Option<UserId>,
    pub deleted: bool,
    pub closed: bool,
    /// Non-deleted messages, recomputed on every write
    pub message_count: u32,
    /// Active recipients, recomputed on every write
    pub recipient_count: u32,
    pub expires_at: Option<DateTime<Utc>>,
    /// What the conversation is about, if anything
    pub about: Option<ContentRef>,
}

impl Thread {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Open, not deleted and not expired
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.deleted && !self.closed && !self.is_expired_at(now)
    }
}

/// Per-user participation record in a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub thread: ThreadId,
    pub user: UserId,
    pub active: bool,
    pub unread: bool,
    pub unread_at: Option<DateTime<Utc>>,
    /// Non-deleted messages this user wrote in the thread
    pub counter: u32,
    /// Has opened the thread at least once
    pub acknowledged: bool,
}

/// A message in a thread
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub thread: ThreadId,
    /// `None` for system messages
    pub author: Option<UserId>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    /// Written back by the external spam scorer, 0..=1
    pub spam_score: Option<f64>,
}

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Pending,
    Accepted,
    Denied,
}

impl NegotiationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationStatus::Pending => "pending",
            NegotiationStatus::Accepted => "accepted",
            NegotiationStatus::Denied => "denied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NegotiationStatus::Pending)
    }
}

impl ToSql for NegotiationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NegotiationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(NegotiationStatus::Pending),
            "accepted" => Ok(NegotiationStatus::Accepted),
            "denied" => Ok(NegotiationStatus::Denied),
            other => Err(rusqlite::types::FromSqlError::Other(
                format!("unknown negotiation status: {}", other).into(),
            )),
        }
    }
}

/// Consent handshake between `source` (requester) and `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub id: NegotiationId,
    pub source: UserId,
    pub target: UserId,
    pub status: NegotiationStatus,
    pub closed: bool,
    /// Thread opened on acceptance
    pub thread: Option<ThreadId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entities with a set of participating users
pub trait HasParticipants {
    fn participants(&self, conn: &Connection) -> Result<BTreeSet<UserId>>;
}

/// Entities that can be closed
pub trait Closeable {
    fn is_closed(&self) -> bool;
}

impl HasParticipants for Thread {
    fn participants(&self, conn: &Connection) -> Result<BTreeSet<UserId>> {
        super::recipients::active_participants(conn, self.id)
    }
}

impl Closeable for Thread {
    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl HasParticipants for Negotiation {
    fn participants(&self, _conn: &Connection) -> Result<BTreeSet<UserId>> {
        Ok([self.source, self.target].into_iter().collect())
    }
}

impl Closeable for Negotiation {
    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Kinds of entity a thread can be about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    User,
    Thread,
    Message,
    /// Entity owned by the surrounding application, e.g. "listing"
    External(String),
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::User => "user",
            ContentKind::Thread => "thread",
            ContentKind::Message => "message",
            ContentKind::External(name) => name,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "user" => ContentKind::User,
            "thread" => ContentKind::Thread,
            "message" => ContentKind::Message,
            other => ContentKind::External(other.to_string()),
        }
    }
}

/// Tagged reference to an entity of any kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub kind: ContentKind,
    pub id: i64,
}

impl ContentRef {
    pub fn new(kind: ContentKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Checks whether a referenced entity still exists
pub type ContentLoader = Arc<dyn Fn(&Connection, i64) -> Result<bool> + Send + Sync>;

/// Maps each [`ContentKind`] to the loader that resolves it
#[derive(Clone)]
pub struct ContentRegistry {
    loaders: HashMap<ContentKind, ContentLoader>,
}

fn row_exists(conn: &Connection, sql: &str, id: i64) -> Result<bool> {
    let found: Option<i64> = conn.query_row(sql, params![id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

impl ContentRegistry {
    /// Registry resolving the engine's own entity kinds
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            loaders: HashMap::new(),
        };
        registry.register(ContentKind::User, |conn, id| {
            row_exists(conn, "SELECT 1 FROM users WHERE id = ?1", id)
        });
        registry.register(ContentKind::Thread, |conn, id| {
            row_exists(conn, "SELECT 1 FROM threads WHERE id = ?1 AND deleted = 0", id)
        });
        registry.register(ContentKind::Message, |conn, id| {
            row_exists(conn, "SELECT 1 FROM messages WHERE id = ?1 AND deleted = 0", id)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ContentKind, loader: F)
    where
        F: Fn(&Connection, i64) -> Result<bool> + Send + Sync + 'static,
    {
        self.loaders.insert(kind, Arc::new(loader));
    }

    /// Whether the referenced entity exists; unknown kinds are an error
    pub fn exists(&self, conn: &Connection, reference: &ContentRef) -> Result<bool> {
        let loader = self.loaders.get(&reference.kind).ok_or_else(|| {
            CourierError::InvalidArgument(format!(
                "no loader registered for content kind '{}'",
                reference.kind.as_str()
            ))
        })?;
        loader(conn, reference.id)
    }
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for ContentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRegistry")
            .field("kinds", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}
