//! Mail types
//!
//! A mail type names a kind of notification, how long the queue waits before
//! sending it, and how it renders.

use crate::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delivery category of a mail type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailCategory {
    /// Activity on the site: messages, contact requests
    Online,
    /// Account and safety notices
    Important,
}

/// A registered kind of notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailType {
    /// Dotted name, e.g. `messaging.message.new`
    pub name: String,

    #[serde(default)]
    pub categories: Vec<MailCategory>,

    /// Minutes between enqueue and the earliest send
    #[serde(default)]
    pub interval_minutes: u32,

    /// Subject template; `{key}` is replaced by the payload values under `key`
    #[serde(default)]
    pub subject: String,

    /// Body template; empty renders every payload key
    #[serde(default)]
    pub template: String,
}

impl MailType {
    pub fn new(name: impl Into<String>, interval_minutes: u32) -> Self {
        Self {
            name: name.into(),
            categories: Vec::new(),
            interval_minutes,
            subject: String::new(),
            template: String::new(),
        }
    }

    pub fn category(mut self, category: MailCategory) -> Self {
        self.categories.push(category);
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.interval_minutes as i64)
    }

    pub fn has_category(&self, category: MailCategory) -> bool {
        self.categories.contains(&category)
    }
}

/// Mail types by name
#[derive(Debug, Clone, Default)]
pub struct MailTypeRegistry {
    types: BTreeMap<String, MailType>,
}

impl MailTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the engine's own notifications
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            MailType::new("messaging.message.new", 10)
                .category(MailCategory::Online)
                .subject("New messages from {sender}")
                .template("{sender} wrote in \"{topic}\":\n\n{message}"),
        );
        registry.register(
            MailType::new("messaging.negotiation.new", 0)
                .category(MailCategory::Online)
                .subject("{sender} would like to contact you")
                .template("{sender} sent you a contact request."),
        );
        registry.register(
            MailType::new("messaging.negotiation.accepted", 0)
                .category(MailCategory::Online)
                .subject("{sender} accepted your contact request")
                .template("{sender} accepted your contact request. You can now write to each other."),
        );
        registry.register(
            MailType::new("account.activation", 0)
                .category(MailCategory::Important)
                .subject("Activate your account")
                .template("Hello {recipient},\n\nuse this link to activate your account: {link}"),
        );
        registry.register(
            MailType::new("alerts.alert", 60)
                .category(MailCategory::Important)
                .subject("New results for {query}")
                .template("{items}"),
        );
        registry
    }

    /// Built-in types, overridden or extended by `configured`
    pub fn from_config(configured: &[MailType]) -> Self {
        let mut registry = Self::with_builtin();
        for mail_type in configured {
            registry.register(mail_type.clone());
        }
        registry
    }

    pub fn register(&mut self, mail_type: MailType) {
        self.types.insert(mail_type.name.clone(), mail_type);
    }

    pub fn get(&self, name: &str) -> Result<&MailType> {
        self.types
            .get(name)
            .ok_or_else(|| CourierError::UnknownMailType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let registry = MailTypeRegistry::with_builtin();
        assert_eq!(registry.len(), 5);
        let message = registry.get("messaging.message.new").unwrap();
        assert_eq!(message.interval(), chrono::Duration::minutes(10));
        assert!(message.has_category(MailCategory::Online));
        assert!(registry
            .get("account.activation")
            .unwrap()
            .has_category(MailCategory::Important));
    }

    #[test]
    fn test_unknown_type() {
        let registry = MailTypeRegistry::with_builtin();
        assert!(matches!(
            registry.get("nope"),
            Err(CourierError::UnknownMailType(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_config_overrides_builtin() {
        let registry = MailTypeRegistry::from_config(&[
            MailType::new("messaging.message.new", 0),
            MailType::new("alerts.digest", 1440),
        ]);
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.get("messaging.message.new").unwrap().interval_minutes, 0);
        assert!(registry.contains("alerts.digest"));
    }

    #[test]
    fn test_yaml_defaults() {
        let mail_type: MailType = serde_yaml::from_str("name: promo.weekly\n").unwrap();
        assert_eq!(mail_type.interval_minutes, 0);
        assert!(mail_type.categories.is_empty());
    }
}
