//! Configuration validation
//!
//! Validates Courier configuration for correctness:
//! - Mail queue ceilings and cadences are positive
//! - Mail type names are non-empty and unique
//! - Quota defaults allow at least one creation per day

use super::courier_config::{CourierConfig, TransportConfig};
use crate::CourierError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a Courier configuration
pub fn validate_config(config: &CourierConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.mail.max_addresses_per_run == 0 {
        errors.push(ValidationError::new(
            "mail.max_addresses_per_run",
            "Must be greater than 0",
        ));
    }
    if config.mail.backlog_factor == 0 {
        errors.push(ValidationError::new(
            "mail.backlog_factor",
            "Must be at least 1",
        ));
    }
    if config.mail.forced_interval_secs == 0 {
        errors.push(ValidationError::new(
            "mail.forced_interval_secs",
            "Must be greater than 0",
        ));
    }
    if config.mail.ordinary_interval_secs == 0 {
        errors.push(ValidationError::new(
            "mail.ordinary_interval_secs",
            "Must be greater than 0",
        ));
    }

    if config.quota.default_max_threads == 0 {
        errors.push(ValidationError::new(
            "quota.default_max_threads",
            "Must be greater than 0",
        ));
    }
    if config.quota.default_max_negotiations == 0 {
        errors.push(ValidationError::new(
            "quota.default_max_negotiations",
            "Must be greater than 0",
        ));
    }

    let mut seen = HashSet::new();
    for mail_type in &config.mail_types {
        if mail_type.name.trim().is_empty() {
            errors.push(ValidationError::new("mail_types", "Mail type name is empty"));
        } else if !seen.insert(mail_type.name.as_str()) {
            errors.push(ValidationError::new(
                "mail_types",
                format!("Duplicate mail type: {}", mail_type.name),
            ));
        }
    }

    if let TransportConfig::Spool { dir } = &config.transport {
        if dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "transport.dir",
                "Spool directory must not be empty",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to a Courier error
pub fn validate_config_result(config: &CourierConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        CourierError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailType;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&CourierConfig::new()).is_ok());
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut config = CourierConfig::new();
        config.mail.max_addresses_per_run = 0;
        config.mail.backlog_factor = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "mail.max_addresses_per_run");
    }

    #[test]
    fn test_duplicate_mail_types() {
        let mut config = CourierConfig::new();
        config.mail_types.push(MailType::new("alerts.digest", 5));
        config.mail_types.push(MailType::new("alerts.digest", 10));

        let err = validate_config_result(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate mail type: alerts.digest"));
    }
}
