//! Cache services
//!
//! Explicit, injected caches with a TTL and an invalidation call. Nothing here
//! is initialized at import time.

mod unread;

pub use unread::UnreadCache;
