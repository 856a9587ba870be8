//! Configuration system
//!
//! Loads ~/.config/courier/config.yaml with support for:
//! - Thread dedup, toggle cooldown and blocklist switches
//! - Per-group quota defaults
//! - Mail queue ceilings, cadences and failure policy
//! - Additional mail types and the notification transport

mod courier_config;
pub mod validation;

pub use courier_config::{
    CourierConfig, FailurePolicy, MailQueueConfig, MessagingConfig, QuotaConfig, TransportConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
