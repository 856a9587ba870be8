//! User directory
//!
//! Accounts, groups and the blocklist are owned by the surrounding application.
//! These tables hold the slice of that data the engine consults: staff flags,
//! privileges, group membership for quotas, mail address and rate policy.

use super::{is_constraint_violation, parse_opt_ts, ts};
use crate::messaging::UserId;
use crate::{CourierError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capabilities granted outside of the staff flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    /// Never subject to daily thread/negotiation quotas
    Unlimited,
    /// Negotiations sent by this user are accepted immediately
    NegotiationBypass,
}

/// A user as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub privileges: BTreeSet<Privilege>,
    pub groups: Vec<String>,
    /// Minimum minutes between two notification mails (0 = no limit)
    pub mail_interval_minutes: u32,
    /// Declined all non-forced mail
    pub mail_opt_out: bool,
    pub last_mailed_at: Option<DateTime<Utc>>,
}

impl User {
    /// Staff or superuser
    pub fn is_privileged(&self) -> bool {
        self.is_staff || self.is_superuser
    }

    pub fn has_privilege(&self, privilege: Privilege) -> bool {
        self.privileges.contains(&privilege)
    }

    /// Whether the user's own rate policy allows another mail at `now`
    pub fn can_receive_at(&self, now: DateTime<Utc>) -> bool {
        if self.mail_opt_out {
            return false;
        }
        match self.last_mailed_at {
            Some(last) => now >= last + Duration::minutes(self.mail_interval_minutes as i64),
            None => true,
        }
    }
}

/// Fields for registering a user
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub privileges: BTreeSet<Privilege>,
    pub groups: Vec<String>,
    pub mail_interval_minutes: u32,
}

impl NewUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn staff(mut self) -> Self {
        self.is_staff = true;
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    pub fn privilege(mut self, privilege: Privilege) -> Self {
        self.privileges.insert(privilege);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn mail_interval(mut self, minutes: u32) -> Self {
        self.mail_interval_minutes = minutes;
        self
    }
}

const USER_COLUMNS: &str = "id, username, email, is_staff, is_superuser, privileges, \
     group_names, mail_interval_minutes, mail_opt_out, last_mailed_at";

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let privileges: String = row.get(5)?;
    let groups: String = row.get(6)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        is_staff: row.get(3)?,
        is_superuser: row.get(4)?,
        privileges: json_column(5, &privileges)?,
        groups: json_column(6, &groups)?,
        mail_interval_minutes: row.get(7)?,
        mail_opt_out: row.get(8)?,
        last_mailed_at: parse_opt_ts(row.get(9)?)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Insert a user and return it with its assigned id
///
/// Usernames and non-empty email addresses are unique.
pub fn insert_user(conn: &Connection, new: &NewUser) -> Result<User> {
    if new.username.trim().is_empty() {
        return Err(CourierError::InvalidArgument(
            "username must not be empty".to_string(),
        ));
    }
    let inserted = conn.execute(
        "INSERT INTO users (username, email, is_staff, is_superuser, privileges, group_names,
                            mail_interval_minutes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.username,
            new.email,
            new.is_staff,
            new.is_superuser,
            serde_json::to_string(&new.privileges)?,
            serde_json::to_string(&new.groups)?,
            new.mail_interval_minutes,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(CourierError::InvalidArgument(format!(
                "username '{}' or its email address is already registered",
                new.username
            )));
        }
        Err(e) => return Err(e.into()),
    }
    let id = UserId(conn.last_insert_rowid());
    tracing::debug!(user_id = %id, username = %new.username, "Registered user");
    require_user(conn, id)
}

pub fn get_user(conn: &Connection, id: UserId) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_user).optional()?)
}

/// Like [`get_user`] but a missing user is an error
pub fn require_user(conn: &Connection, id: UserId) -> Result<User> {
    get_user(conn, id)?.ok_or_else(|| CourierError::not_found("user", id))
}

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE email = ?1 ORDER BY id LIMIT 1",
        USER_COLUMNS
    );
    Ok(conn.query_row(&sql, params![email], row_to_user).optional()?)
}

pub fn username(conn: &Connection, id: UserId) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT username FROM users WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Configure the daily caps of a group
pub fn set_group_quota(
    conn: &Connection,
    group: &str,
    max_threads: u32,
    max_negotiations: u32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO group_quotas (group_name, max_threads, max_negotiations) VALUES (?1, ?2, ?3)
         ON CONFLICT(group_name) DO UPDATE SET max_threads = ?2, max_negotiations = ?3",
        params![group, max_threads, max_negotiations],
    )?;
    Ok(())
}

/// Configured (max_threads, max_negotiations) for each of `groups` that has a quota
pub fn group_quotas(conn: &Connection, groups: &[String]) -> Result<Vec<(u32, u32)>> {
    let mut stmt = conn
        .prepare_cached("SELECT max_threads, max_negotiations FROM group_quotas WHERE group_name = ?1")?;
    let mut quotas = Vec::new();
    for group in groups {
        if let Some(quota) = stmt
            .query_row(params![group], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
        {
            quotas.push(quota);
        }
    }
    Ok(quotas)
}

/// `owner` no longer accepts contact from `blocked`
pub fn block(conn: &Connection, owner: UserId, blocked: UserId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO blocks (owner_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
        params![owner, blocked, ts(Utc::now())],
    )?;
    Ok(())
}

pub fn unblock(conn: &Connection, owner: UserId, blocked: UserId) -> Result<()> {
    conn.execute(
        "DELETE FROM blocks WHERE owner_id = ?1 AND blocked_id = ?2",
        params![owner, blocked],
    )?;
    Ok(())
}

pub fn is_blocked(conn: &Connection, owner: UserId, blocked: UserId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM blocks WHERE owner_id = ?1 AND blocked_id = ?2",
            params![owner, blocked],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Record that a notification mail went out to `id`
pub fn mark_mailed(conn: &Connection, id: UserId, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_mailed_at = ?1 WHERE id = ?2",
        params![ts(at), id],
    )?;
    Ok(())
}

pub fn set_opt_out(conn: &Connection, id: UserId, opt_out: bool) -> Result<()> {
    conn.execute(
        "UPDATE users SET mail_opt_out = ?1 WHERE id = ?2",
        params![opt_out, id],
    )?;
    Ok(())
}
