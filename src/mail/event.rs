//! Queued mail events
//!
//! One pending event exists per (recipient, mail type, forced). Payloads are
//! maps of lists so a second enqueue for the same slot appends to the first.

use crate::messaging::types::id_type;
use crate::messaging::UserId;
use crate::{CourierError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

id_type!(MailEventId);

/// Who a notification goes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailRecipient {
    /// A registered user; the address is looked up at send time
    User(UserId),
    /// A bare address with no account behind it
    Address(String),
}

impl MailRecipient {
    /// Normalized key used for merging pending events
    pub fn key(&self) -> String {
        match self {
            MailRecipient::User(id) => format!("user:{}", id),
            MailRecipient::Address(address) => format!("address:{}", address.trim().to_lowercase()),
        }
    }
}

impl fmt::Display for MailRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailRecipient::User(id) => write!(f, "user {}", id),
            MailRecipient::Address(address) => f.write_str(address),
        }
    }
}

/// Payload of a mail event: every key holds a list of values
pub type MailPayload = BTreeMap<String, Vec<Value>>;

/// Turn enqueue data into a payload
///
/// Scalars become one-element lists; `null` is an empty payload. Anything but
/// an object or `null` is rejected.
pub fn listify(data: &Value) -> Result<MailPayload> {
    match data {
        Value::Null => Ok(MailPayload::new()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(key, value)| {
                let values = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                (key.clone(), values)
            })
            .collect()),
        other => Err(CourierError::InvalidArgument(format!(
            "mail data must be an object, got {}",
            other
        ))),
    }
}

/// Append every list in `incoming` to the matching list in `target`
pub fn merge_payload(target: &mut MailPayload, incoming: MailPayload) {
    for (key, mut values) in incoming {
        target.entry(key).or_default().append(&mut values);
    }
}

/// A queued notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailEvent {
    pub id: MailEventId,
    pub mail_type: String,
    pub recipient: MailRecipient,
    pub payload: MailPayload,
    /// Sent on the forced cadence, ignoring the recipient's rate policy
    pub forced: bool,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    /// Dropped without sending: recipient present, opted out or unresolvable
    pub discarded: bool,
    /// Earliest send time
    pub minimum_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MailEvent {
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.minimum_time <= now
    }

    pub fn is_pending(&self) -> bool {
        !self.sent && !self.discarded
    }

    /// Values stored under `key`, empty if absent
    pub fn values(&self, key: &str) -> &[Value] {
        self.payload.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recipient_key_normalizes_addresses() {
        assert_eq!(MailRecipient::User(UserId(7)).key(), "user:7");
        assert_eq!(
            MailRecipient::Address(" Ops@Example.com ".to_string()).key(),
            "address:ops@example.com"
        );
    }

    #[test]
    fn test_listify() {
        let payload = listify(&json!({"sender": "a", "items": [1, 2]})).unwrap();
        assert_eq!(payload["sender"], vec![json!("a")]);
        assert_eq!(payload["items"], vec![json!(1), json!(2)]);
        assert!(listify(&Value::Null).unwrap().is_empty());
        assert!(listify(&json!("text")).is_err());
    }

    #[test]
    fn test_merge_appends_in_order() {
        let mut payload = listify(&json!({"message": "first"})).unwrap();
        merge_payload(
            &mut payload,
            listify(&json!({"message": "second", "sender": "b"})).unwrap(),
        );
        assert_eq!(payload["message"], vec![json!("first"), json!("second")]);
        assert_eq!(payload["sender"], vec![json!("b")]);
    }
}
