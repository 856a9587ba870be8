//! Mail transport abstraction
//!
//! Defines the trait for pluggable delivery backends. The queue marks events
//! sent before calling the transport, so a transport never sees an event twice
//! unless the failure policy requeues it.

use super::render::Envelope;
use crate::config::TransportConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("delivery to {address} refused: {reason}")]
    Refused { address: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Trait for delivery backends
pub trait MailTransport: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Hand one rendered notification to the backend
    fn deliver(&self, envelope: &Envelope) -> Result<()>;
}

/// Writes every notification to the log
#[derive(Debug, Default)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, envelope: &Envelope) -> Result<()> {
        tracing::info!(
            to = %envelope.to,
            mail_type = %envelope.mail_type,
            subject = %envelope.subject,
            "Delivered notification"
        );
        tracing::debug!(body = %envelope.text);
        Ok(())
    }
}

/// Writes each notification as a JSON file into a spool directory
#[derive(Debug)]
pub struct SpoolTransport {
    dir: PathBuf,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MailTransport for SpoolTransport {
    fn name(&self) -> &'static str {
        "spool"
    }

    fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%6f");
        let path = self
            .dir
            .join(format!("{}-{}.json", stamp, envelope.event_id));
        let content = serde_json::to_string_pretty(envelope)?;
        std::fs::write(&path, content)?;
        tracing::debug!(path = %path.display(), "Spooled notification");
        Ok(())
    }
}

/// Keeps notifications in memory; addresses can be set to fail
#[derive(Debug, Default)]
pub struct MemoryTransport {
    delivered: Mutex<Vec<Envelope>>,
    failing: Mutex<HashSet<String>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every delivery to `address` from now on
    pub fn fail_for(&self, address: impl Into<String>) {
        guard(&self.failing).insert(address.into());
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        guard(&self.delivered).clone()
    }

    /// Delivered notifications, emptying the outbox
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *guard(&self.delivered))
    }
}

impl MailTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn deliver(&self, envelope: &Envelope) -> Result<()> {
        if guard(&self.failing).contains(&envelope.to) {
            return Err(TransportError::Refused {
                address: envelope.to.clone(),
                reason: "address configured to fail".to_string(),
            });
        }
        guard(&self.delivered).push(envelope.clone());
        Ok(())
    }
}

/// Build the transport selected in the configuration
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn MailTransport>> {
    Ok(match config {
        TransportConfig::Log => Arc::new(LogTransport),
        TransportConfig::Spool { dir } => Arc::new(SpoolTransport::new(dir.clone())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailEventId;
    use tempfile::TempDir;

    fn envelope(to: &str) -> Envelope {
        Envelope {
            event_id: MailEventId(3),
            mail_type: "alerts.alert".to_string(),
            to: to.to_string(),
            subject: "s".to_string(),
            text: "t".to_string(),
            html: "<p>t</p>".to_string(),
        }
    }

    #[test]
    fn test_memory_transport_failures() {
        let transport = MemoryTransport::new();
        transport.fail_for("bad@example.com");
        assert!(transport.deliver(&envelope("ok@example.com")).is_ok());
        assert!(transport.deliver(&envelope("bad@example.com")).is_err());
        assert_eq!(transport.take().len(), 1);
        assert!(transport.delivered().is_empty());
    }

    #[test]
    fn test_spool_transport_writes_json() {
        let temp_dir = TempDir::new().unwrap();
        let transport = SpoolTransport::new(temp_dir.path().join("spool")).unwrap();
        transport.deliver(&envelope("ok@example.com")).unwrap();

        let files: Vec<_> = std::fs::read_dir(transport.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let stored: Envelope =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored.to, "ok@example.com");
    }

    #[test]
    fn test_from_config() {
        let transport = from_config(&TransportConfig::Log).unwrap();
        assert_eq!(transport.name(), "log");
    }
}
