//! Fixtures shared by the messaging unit tests

use super::recipients::RecipientTracker;
use super::threads;
use super::types::{ThreadId, UserId};
use crate::mail::MemoryTransport;
use crate::store::{ts, users, NewUser, Store};
use crate::{CourierConfig, Messenger, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;

/// Register one user per name, each with `<name>@example.com`
pub(crate) fn seed_users<const N: usize>(conn: &Connection, names: [&str; N]) -> Result<[UserId; N]> {
    let mut ids = [UserId(0); N];
    for (slot, name) in ids.iter_mut().zip(names) {
        let user = users::insert_user(conn, &NewUser::new(name).email(format!("{}@example.com", name)))?;
        *slot = user.id;
    }
    Ok(ids)
}

/// Bare thread row with `members` attached, bypassing every validator
pub(crate) fn seed_thread(
    conn: &Connection,
    tracker: &RecipientTracker,
    author: UserId,
    members: &[UserId],
) -> Result<ThreadId> {
    conn.execute(
        "INSERT INTO threads (author_id, topic, created_at, updated_at) VALUES (?1, 'test', ?2, ?2)",
        params![author, ts(Utc::now())],
    )?;
    let id = ThreadId(conn.last_insert_rowid());
    tracker.attach(conn, id, &members.iter().copied().collect())?;
    threads::refresh_counters(conn, id)?;
    Ok(id)
}

pub(crate) fn messenger_with(config: CourierConfig) -> Messenger {
    let store = Arc::new(Store::in_memory().unwrap());
    Messenger::builder(store, config)
        .transport(Arc::new(MemoryTransport::new()))
        .build()
        .unwrap()
}

pub(crate) fn messenger() -> Messenger {
    messenger_with(CourierConfig::new())
}
