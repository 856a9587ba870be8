//! Courier configuration file handling
//!
//! Loads and manages ~/.config/courier/config.yaml. Every section falls back
//! to documented defaults so an empty file is a valid configuration.

use crate::mail::MailType;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Thread, recipient and negotiation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Reuse an open thread with the exact same participant set
    #[serde(default = "default_true")]
    pub unique_threads: bool,

    /// Seconds a thread author must wait between open/close toggles
    #[serde(default = "default_toggle_cooldown")]
    pub toggle_cooldown_secs: u64,

    /// Consult the blocklist before contact (MESSAGING_BLACKLIST)
    #[serde(default = "default_true")]
    pub blacklist_enabled: bool,

    /// Require an accepted negotiation before non-staff users start a thread
    #[serde(default)]
    pub require_negotiation: bool,

    /// Threads created by an accepted negotiation start closed
    #[serde(default = "default_true")]
    pub negotiation_thread_closed: bool,

    /// Lifetime of cached unread counts, in seconds
    #[serde(default = "default_unread_cache_ttl")]
    pub unread_cache_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_toggle_cooldown() -> u64 {
    3600
}

fn default_unread_cache_ttl() -> u64 {
    60
}

impl MessagingConfig {
    pub fn toggle_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.toggle_cooldown_secs as i64)
    }

    pub fn unread_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.unread_cache_ttl_secs)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            unique_threads: true,
            toggle_cooldown_secs: default_toggle_cooldown(),
            blacklist_enabled: true,
            require_negotiation: false,
            negotiation_thread_closed: true,
            unread_cache_ttl_secs: default_unread_cache_ttl(),
        }
    }
}

/// Daily creation caps for users without a group quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_max_threads")]
    pub default_max_threads: u32,

    #[serde(default = "default_max_negotiations")]
    pub default_max_negotiations: u32,
}

fn default_max_threads() -> u32 {
    20
}

fn default_max_negotiations() -> u32 {
    10
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_max_threads: default_max_threads(),
            default_max_negotiations: default_max_negotiations(),
        }
    }
}

/// What happens to an event whose transport call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the event marked sent; a failed notification is dropped
    #[default]
    KeepSent,
    /// Reset the event to unsent so the next drain tries again
    Requeue,
}

/// Mail queue batch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailQueueConfig {
    /// Destination addresses handled per drain
    #[serde(default = "default_max_addresses")]
    pub max_addresses_per_run: usize,

    /// The ceiling is raised once queue depth exceeds this multiple of it
    #[serde(default = "default_backlog_factor")]
    pub backlog_factor: usize,

    /// Cadence of the forced drain, in seconds
    #[serde(default = "default_forced_interval")]
    pub forced_interval_secs: u64,

    /// Cadence of the ordinary drain, in seconds
    #[serde(default = "default_ordinary_interval")]
    pub ordinary_interval_secs: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_max_addresses() -> usize {
    30
}

fn default_backlog_factor() -> usize {
    8
}

fn default_forced_interval() -> u64 {
    25
}

fn default_ordinary_interval() -> u64 {
    150
}

impl MailQueueConfig {
    /// Address ceiling for a queue holding `depth` pending events
    pub fn ceiling_for(&self, depth: usize) -> usize {
        let ceiling = self.max_addresses_per_run;
        let factor = self.backlog_factor.max(1);
        if depth > ceiling.saturating_mul(factor) {
            depth.div_ceil(factor)
        } else {
            ceiling
        }
    }

    pub fn forced_interval(&self) -> Duration {
        Duration::from_secs(self.forced_interval_secs)
    }

    pub fn ordinary_interval(&self) -> Duration {
        Duration::from_secs(self.ordinary_interval_secs)
    }
}

impl Default for MailQueueConfig {
    fn default() -> Self {
        Self {
            max_addresses_per_run: default_max_addresses(),
            backlog_factor: default_backlog_factor(),
            forced_interval_secs: default_forced_interval(),
            ordinary_interval_secs: default_ordinary_interval(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Where rendered notifications go
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Write each notification to the log
    #[default]
    Log,
    /// Write each notification as a JSON file under `dir`
    Spool { dir: PathBuf },
}

/// Courier configuration
///
/// Represents the complete ~/.config/courier/config.yaml file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub mail: MailQueueConfig,

    /// Mail types added to (or replacing) the built-in ones
    #[serde(default)]
    pub mail_types: Vec<MailType>,

    #[serde(default)]
    pub transport: TransportConfig,
}

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("courier");
    path
}

fn default_database_path() -> PathBuf {
    config_dir().join("courier.db")
}

impl CourierConfig {
    /// Create a configuration with every default
    pub fn new() -> Self {
        Self {
            database: default_database_path(),
            messaging: MessagingConfig::default(),
            quota: QuotaConfig::default(),
            mail: MailQueueConfig::default(),
            mail_types: Vec::new(),
            transport: TransportConfig::default(),
        }
    }

    /// Load configuration from the default path (~/.config/courier/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::CourierError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading Courier configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            database = %config.database.display(),
            mail_types = config.mail_types.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving Courier configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/courier/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self::new()
    }
}
