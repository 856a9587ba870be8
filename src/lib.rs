//! Courier - conversation threads and batched notification mail
//!
//! Courier is the messaging layer of a community site: members exchange
//! messages in threads, optionally after a contact negotiation, and every
//! notable event is queued as mail that a background drain delivers in
//! rate-limited batches.
//!
//! # Architecture
//!
//! - **store**: SQLite persistence, schema and the user directory
//! - **events**: Synchronous event bus with veto-capable handlers
//! - **messaging**: Threads, messages, read state, quotas, contact rules and negotiations
//! - **mail**: Notification queue, rendering, transports and the drain scheduler
//! - **cache**: Unread-count cache
//! - **config**: YAML configuration and validation
//! - **messenger**: Wiring of all of the above behind one facade

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

// Components
pub mod cache;
pub mod events;
pub mod mail;
pub mod messaging;
pub mod messenger;

// Re-exports
pub use config::CourierConfig;
pub use error::{CourierError, Result};
pub use messenger::{Messenger, MessengerBuilder};
