//! Blocklist checks
//!
//! A user who blocked someone receives no new threads from them. In an existing
//! thread a message is only vetoed when every other participant blocks the
//! author; otherwise those who block the author simply get no mail.

use super::threads;
use super::types::{HasParticipants, UserId};
use crate::events::{Event, EventHandler, Verdict};
use crate::store::users;
use crate::Result;
use rusqlite::Connection;

/// Whether `recipient` accepts contact from `sender`
pub fn can_contact(conn: &Connection, sender: UserId, recipient: UserId) -> Result<bool> {
    Ok(!users::is_blocked(conn, recipient, sender)?)
}

/// Subscribed to `thread.pre_create` and `message.pre_send`
#[derive(Debug, Default)]
pub struct BlocklistGuard;

impl EventHandler for BlocklistGuard {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict> {
        match event {
            Event::ThreadPreCreate {
                author, recipients, ..
            } => {
                let mut reasons = Vec::new();
                for recipient in recipients.iter().filter(|r| *r != author) {
                    if !can_contact(conn, *author, *recipient)? {
                        let name = users::username(conn, *recipient)?
                            .unwrap_or_else(|| recipient.to_string());
                        reasons.push(format!("{} does not accept messages from you", name));
                    }
                }
                Ok(Verdict::from_reasons(reasons))
            }
            Event::MessagePreSend {
                author: Some(author),
                thread,
            } => {
                let thread = threads::require(conn, *thread)?;
                let others: Vec<UserId> = thread
                    .participants(conn)?
                    .into_iter()
                    .filter(|user| user != author)
                    .collect();
                if others.is_empty() {
                    return Ok(Verdict::Accept);
                }
                for other in &others {
                    if can_contact(conn, *author, *other)? {
                        return Ok(Verdict::Accept);
                    }
                }
                Ok(Verdict::reject(
                    "every other participant has blocked you".to_string(),
                ))
            }
            _ => Ok(Verdict::Accept),
        }
    }
}
