//! Notification rendering
//!
//! Fills a mail type's subject and body templates from an event payload and
//! produces a plain-text and an HTML body.

use super::event::{MailEvent, MailEventId};
use super::types::MailType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A rendered notification ready for a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: MailEventId,
    pub mail_type: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup(event: &MailEvent, recipient_name: &str, key: &str) -> String {
    if key == "recipient" && !event.payload.contains_key("recipient") {
        return recipient_name.to_string();
    }
    let values = event.values(key);
    if key == "message" || key == "items" {
        values.iter().map(value_text).collect::<Vec<_>>().join("\n\n")
    } else {
        let mut distinct: Vec<String> = Vec::new();
        for text in values.iter().map(value_text) {
            if !distinct.contains(&text) {
                distinct.push(text);
            }
        }
        distinct.join(", ")
    }
}

/// Replace every `{key}` in `template`; unknown keys render empty
fn fill(template: &str, event: &MailEvent, recipient_name: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end)
                if end > 0
                    && after[..end]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                out.push_str(&lookup(event, recipient_name, &after[..end]));
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn default_body(event: &MailEvent) -> String {
    event
        .payload
        .iter()
        .map(|(key, values)| {
            let joined = values.iter().map(value_text).collect::<Vec<_>>().join(", ");
            format!("{}: {}", key, joined)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn to_html(text: &str) -> String {
    text.split("\n\n")
        .filter(|paragraph| !paragraph.trim().is_empty())
        .map(|paragraph| {
            let lines: Vec<String> = paragraph.lines().map(escape_html).collect();
            format!("<p>{}</p>", lines.join("<br>"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render `event` for delivery to `to`
pub fn render(mail_type: &MailType, event: &MailEvent, to: &str, recipient_name: &str) -> Envelope {
    let subject = if mail_type.subject.is_empty() {
        mail_type.name.clone()
    } else {
        fill(&mail_type.subject, event, recipient_name)
    };
    let text = if mail_type.template.is_empty() {
        default_body(event)
    } else {
        fill(&mail_type.template, event, recipient_name)
    };
    let html = to_html(&text);

    Envelope {
        event_id: event.id,
        mail_type: mail_type.name.clone(),
        to: to.to_string(),
        subject: subject.lines().next().unwrap_or_default().to_string(),
        text,
        html,
    }
}
