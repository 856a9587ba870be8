//! Daily quotas
//!
//! Limits how many threads and negotiations a user may create per UTC day.
//! Limits come from the user's groups (the most generous group wins) and fall
//! back to the configured defaults.

use super::types::UserId;
use crate::config::QuotaConfig;
use crate::events::{Event, EventHandler, Verdict};
use crate::store::{start_of_day, ts, users, Privilege, User};
use crate::Result;
use chrono::Utc;
use rusqlite::{params, Connection};

/// Per-day limits that apply to one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_threads: u32,
    pub max_negotiations: u32,
}

#[derive(Debug, Clone)]
pub struct QuotaEnforcer {
    defaults: QuotaConfig,
}

impl QuotaEnforcer {
    pub fn new(defaults: QuotaConfig) -> Self {
        Self { defaults }
    }

    /// Staff, superusers and holders of [`Privilege::Unlimited`]
    pub fn is_unlimited(&self, user: &User) -> bool {
        user.is_privileged() || user.has_privilege(Privilege::Unlimited)
    }

    pub fn limits_for(&self, conn: &Connection, user: &User) -> Result<QuotaLimits> {
        let quotas = users::group_quotas(conn, &user.groups)?;
        if quotas.is_empty() {
            return Ok(QuotaLimits {
                max_threads: self.defaults.default_max_threads,
                max_negotiations: self.defaults.default_max_negotiations,
            });
        }
        Ok(QuotaLimits {
            max_threads: quotas.iter().map(|(threads, _)| *threads).max().unwrap_or(0),
            max_negotiations: quotas.iter().map(|(_, negotiations)| *negotiations).max().unwrap_or(0),
        })
    }

    fn count_since_midnight(&self, conn: &Connection, sql: &str, user: UserId) -> Result<u32> {
        let since = ts(start_of_day(Utc::now()));
        let count: i64 = conn.query_row(sql, params![user, since], |row| row.get(0))?;
        Ok(count as u32)
    }

    /// Threads authored today, deleted ones included
    pub fn threads_today(&self, conn: &Connection, user: UserId) -> Result<u32> {
        self.count_since_midnight(
            conn,
            "SELECT COUNT(*) FROM threads WHERE author_id = ?1 AND created_at >= ?2",
            user,
        )
    }

    pub fn negotiations_today(&self, conn: &Connection, user: UserId) -> Result<u32> {
        self.count_since_midnight(
            conn,
            "SELECT COUNT(*) FROM negotiations WHERE source_id = ?1 AND created_at >= ?2",
            user,
        )
    }

    /// Whether today's thread count has gone past the limit
    pub fn exceeded_threads(&self, conn: &Connection, user: &User) -> Result<bool> {
        if self.is_unlimited(user) {
            return Ok(false);
        }
        let limits = self.limits_for(conn, user)?;
        Ok(self.threads_today(conn, user.id)? > limits.max_threads)
    }

    /// Whether today's negotiation count has gone past the limit
    pub fn exceeded_negotiations(&self, conn: &Connection, user: &User) -> Result<bool> {
        if self.is_unlimited(user) {
            return Ok(false);
        }
        let limits = self.limits_for(conn, user)?;
        Ok(self.negotiations_today(conn, user.id)? > limits.max_negotiations)
    }
}

/// Vetoes `thread.pre_create` for authors over their daily thread quota
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    quota: QuotaEnforcer,
}

impl QuotaGuard {
    pub fn new(quota: QuotaEnforcer) -> Self {
        Self { quota }
    }
}

impl EventHandler for QuotaGuard {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn handle(&self, conn: &Connection, event: &Event) -> Result<Verdict> {
        let Event::ThreadPreCreate { author, force, .. } = event else {
            return Ok(Verdict::Accept);
        };
        if *force {
            return Ok(Verdict::Accept);
        }
        let user = users::require_user(conn, *author)?;
        if self.quota.exceeded_threads(conn, &user)? {
            let limits = self.quota.limits_for(conn, &user)?;
            return Ok(Verdict::reject(format!(
                "daily limit of {} new conversations reached",
                limits.max_threads
            )));
        }
        Ok(Verdict::Accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::{messenger_with, seed_users};
    use crate::messaging::ThreadRequest;
    use crate::store::NewUser;
    use crate::CourierConfig;

    fn config(max_threads: u32) -> CourierConfig {
        let mut config = CourierConfig::new();
        config.quota.default_max_threads = max_threads;
        config.quota.default_max_negotiations = 1;
        config
    }

    #[test]
    fn test_group_quota_takes_the_most_generous_group() {
        let m = messenger_with(config(2));
        m.store()
            .transaction(|tx| {
                users::set_group_quota(tx, "trial", 1, 1)?;
                users::set_group_quota(tx, "members", 5, 3)?;
                let member = users::insert_user(tx, &NewUser::new("m").group("trial").group("members"))?;
                let plain = users::insert_user(tx, &NewUser::new("p"))?;

                let limits = m.quota().limits_for(tx, &member)?;
                assert_eq!(limits, QuotaLimits { max_threads: 5, max_negotiations: 3 });
                assert_eq!(m.quota().limits_for(tx, &plain)?.max_threads, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_thread_quota_is_monotonic_within_a_day() {
        let m = messenger_with(config(2));
        m.store()
            .transaction(|tx| {
                let [a, b, c, d, e] = seed_users(tx, ["a", "b", "c", "d", "e"])?;
                let user = users::require_user(tx, a)?;
                assert!(!m.quota().exceeded_threads(tx, &user)?);

                m.threads().find_or_create(tx, ThreadRequest::new(a, [b], "1"))?;
                m.threads().find_or_create(tx, ThreadRequest::new(a, [c], "2"))?;
                // Reaching the limit is not exceeding it.
                assert!(!m.quota().exceeded_threads(tx, &user)?);
                let third = m.threads().find_or_create(tx, ThreadRequest::new(a, [d], "3"))?;
                assert!(m.quota().exceeded_threads(tx, &user)?);

                // Deleting does not give the quota back.
                m.threads().delete(tx, third.thread.id, false)?;
                assert!(m.quota().exceeded_threads(tx, &user)?);

                let err = m
                    .threads()
                    .find_or_create(tx, ThreadRequest::new(a, [e], "4"))
                    .unwrap_err();
                assert!(err.reasons()[0].contains("daily limit"));

                // Force skips the quota.
                m.threads()
                    .find_or_create(tx, ThreadRequest::new(a, [e], "4").force())?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unlimited_users_are_never_exceeded() {
        let m = messenger_with(config(0));
        m.store()
            .transaction(|tx| {
                let staff = users::insert_user(tx, &NewUser::new("s").staff())?;
                let vip = users::insert_user(tx, &NewUser::new("v").privilege(Privilege::Unlimited))?;
                let plain = users::insert_user(tx, &NewUser::new("p"))?;
                assert!(!m.quota().exceeded_threads(tx, &staff)?);
                assert!(!m.quota().exceeded_negotiations(tx, &vip)?);
                assert!(m.quota().exceeded_threads(tx, &plain)?);
                Ok(())
            })
            .unwrap();
    }
}
