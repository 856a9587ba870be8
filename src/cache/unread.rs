//! Per-user unread-count cache

use crate::messaging::UserId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: usize,
    stored_at: Instant,
}

/// Short-lived cache of unread-thread counts, keyed by user
///
/// Entries expire after `ttl`. Every mutation of a user's recipient state must
/// call [`UnreadCache::invalidate`] for that user before returning.
#[derive(Debug)]
pub struct UnreadCache {
    ttl: Duration,
    entries: Mutex<HashMap<UserId, Entry>>,
}

impl UnreadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // A poisoned map only holds counts; keep using it.
    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cached count, if present and fresh
    pub fn get(&self, user: UserId) -> Option<usize> {
        let mut entries = self.entries();
        match entries.get(&user) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.count),
            Some(_) => {
                entries.remove(&user);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, user: UserId, count: usize) {
        self.entries().insert(
            user,
            Entry {
                count,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, user: UserId) {
        self.entries().remove(&user);
    }

    pub fn invalidate_many(&self, users: impl IntoIterator<Item = UserId>) {
        let mut entries = self.entries();
        for user in users {
            entries.remove(&user);
        }
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UnreadCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
