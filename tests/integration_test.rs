//! Integration tests for Courier
//!
//! These tests drive the public facade end to end: threads, read state,
//! quotas, negotiations and the mail queue with an in-memory transport.

use courier::config::{FailurePolicy, TransportConfig};
use courier::mail::{MailRecipient, MemoryTransport, ProcessMode};
use courier::messaging::{NegotiationOutcome, ThreadRequest, UserId, NEW_MESSAGE_MAIL};
use courier::store::{NewUser, Store};
use courier::{CourierConfig, Messenger};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

/// Messenger over an in-memory database, returning its outbox
fn setup(config: CourierConfig) -> (Messenger, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let messenger = Messenger::builder(Arc::new(Store::in_memory().unwrap()), config)
        .transport(transport.clone())
        .build()
        .unwrap();
    (messenger, transport)
}

fn register(m: &Messenger, name: &str) -> UserId {
    m.register_user(&NewUser::new(name).email(format!("{}@example.com", name)))
        .unwrap()
        .id
}

mod conversation_tests {
    use super::*;

    #[test]
    fn test_conversation_end_to_end() {
        let (m, outbox) = setup(CourierConfig::new());
        let alice = register(&m, "alice");
        let bob = register(&m, "bob");

        let outcome = m
            .start_thread(ThreadRequest::new(alice, [bob], "Bike for sale").body("Still available?"))
            .unwrap();
        assert!(outcome.created);
        assert!(outcome.message.is_some());
        assert_eq!(m.unread_count(bob).unwrap(), 1);
        assert_eq!(m.unread_count(alice).unwrap(), 0);

        let report = m.drain(ProcessMode::All, true).unwrap();
        assert_eq!(report.sent, 1);
        let delivered = outbox.take();
        assert_eq!(delivered[0].to, "bob@example.com");
        assert!(delivered[0].subject.contains("alice"));
        assert!(delivered[0].text.contains("Still available?"));

        let (thread, messages) = m.open_thread(bob, outcome.thread.id).unwrap();
        assert_eq!(thread.topic, "Bike for sale");
        assert_eq!(messages.len(), 1);
        assert_eq!(m.unread_count(bob).unwrap(), 0);

        m.reply(bob, thread.id, "Yes it is").unwrap();
        assert_eq!(m.unread_count(alice).unwrap(), 1);
        assert_eq!(m.inbox(alice, false).unwrap().len(), 1);
    }

    #[test]
    fn test_group_thread_notifies_and_merges() {
        let (m, _) = setup(CourierConfig::new());
        let a = register(&m, "a");
        let b = register(&m, "b");
        let c = register(&m, "c");

        let first = m
            .start_thread(ThreadRequest::new(a, [b, c], "plans").body("hello"))
            .unwrap();
        assert_eq!(first.thread.recipient_count, 3);

        let pending = m.store().with_conn(|conn| m.mail().pending(conn)).unwrap();
        assert_eq!(pending.len(), 2);
        for event in &pending {
            assert_eq!(event.mail_type, NEW_MESSAGE_MAIL);
            assert_eq!(event.values("sender"), &[json!("a")]);
            assert_eq!(event.values("message"), &[json!("hello")]);
        }

        let second = m
            .start_thread(ThreadRequest::new(a, [b, c], "plans").body("again"))
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.thread.id, first.thread.id);

        let (_, messages) = m.open_thread(a, first.thread.id).unwrap();
        assert_eq!(messages.len(), 2);
        let pending = m.store().with_conn(|conn| m.mail().pending(conn)).unwrap();
        assert_eq!(pending.len(), 2);
        for event in &pending {
            assert_eq!(event.values("message"), &[json!("hello"), json!("again")]);
        }
    }

    #[test]
    fn test_unique_threads_are_reused() {
        let (m, _) = setup(CourierConfig::new());
        let a = register(&m, "a");
        let b = register(&m, "b");

        let first = m.start_thread(ThreadRequest::new(a, [b], "one")).unwrap();
        let second = m.start_thread(ThreadRequest::new(b, [a], "two")).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.thread.id, second.thread.id);

        let separate = m
            .start_thread(ThreadRequest::new(a, [b], "three").unique(false))
            .unwrap();
        assert!(separate.created);
        assert_ne!(separate.thread.id, first.thread.id);
    }

    #[test]
    fn test_unread_round_trip() {
        let (m, _) = setup(CourierConfig::new());
        let a = register(&m, "a");
        let b = register(&m, "b");
        let c = register(&m, "c");
        let thread = m
            .start_thread(ThreadRequest::new(a, [b, c], "group").body("hi all"))
            .unwrap()
            .thread;

        assert_eq!(m.unread_count(b).unwrap(), 1);
        assert_eq!(m.unread_count(c).unwrap(), 1);

        m.open_thread(b, thread.id).unwrap();
        assert_eq!(m.unread_count(b).unwrap(), 0);
        assert_eq!(m.unread_count(c).unwrap(), 1);

        assert!(m.mark_unread(b, thread.id).unwrap());
        assert_eq!(m.unread_count(b).unwrap(), 1);
    }

    #[test]
    fn test_blocked_author_is_rejected() {
        let (m, _) = setup(CourierConfig::new());
        let a = register(&m, "a");
        let b = register(&m, "b");
        m.block(b, a).unwrap();

        let err = m.start_thread(ThreadRequest::new(a, [b], "hi")).unwrap_err();
        assert!(err.is_rejection());
        assert!(err.reasons().iter().any(|r| r.contains("does not accept messages")));

        m.unblock(b, a).unwrap();
        assert!(m.start_thread(ThreadRequest::new(a, [b], "hi")).is_ok());
    }
}

mod quota_tests {
    use super::*;

    #[test]
    fn test_thread_quota_is_monotonic() {
        let mut config = CourierConfig::new();
        config.quota.default_max_threads = 2;
        let (m, _) = setup(config);
        let a = register(&m, "a");
        let b = register(&m, "b");
        let c = register(&m, "c");
        let d = register(&m, "d");

        let e = register(&m, "e");

        m.start_thread(ThreadRequest::new(a, [b], "1")).unwrap();
        m.start_thread(ThreadRequest::new(a, [c], "2")).unwrap();
        assert!(!m.exceeded_threads(a).unwrap());
        m.start_thread(ThreadRequest::new(a, [d], "3")).unwrap();
        assert!(m.exceeded_threads(a).unwrap());

        let err = m.start_thread(ThreadRequest::new(a, [e], "4")).unwrap_err();
        assert!(err.is_rejection());
        // A rejected attempt does not move the counter back.
        assert!(m.exceeded_threads(a).unwrap());

        // Forcing skips the quota.
        assert!(m.start_thread(ThreadRequest::new(a, [e], "5").force()).is_ok());
    }

    #[test]
    fn test_group_quota_overrides_default() {
        let mut config = CourierConfig::new();
        config.quota.default_max_threads = 1;
        let (m, _) = setup(config);
        m.set_group_quota("members", 5, 5).unwrap();
        let member = m
            .register_user(&NewUser::new("m").email("m@example.com").group("members"))
            .unwrap()
            .id;
        let b = register(&m, "b");
        let c = register(&m, "c");
        let d = register(&m, "d");

        m.start_thread(ThreadRequest::new(member, [b], "1")).unwrap();
        m.start_thread(ThreadRequest::new(member, [c], "2")).unwrap();
        assert!(m.start_thread(ThreadRequest::new(member, [d], "3")).is_ok());
    }
}

mod negotiation_tests {
    use super::*;

    fn negotiating_config() -> CourierConfig {
        let mut config = CourierConfig::new();
        config.messaging.require_negotiation = true;
        config
    }

    #[test]
    fn test_negotiation_gates_threads() {
        let (m, outbox) = setup(negotiating_config());
        let a = register(&m, "a");
        let b = register(&m, "b");

        assert!(m
            .start_thread(ThreadRequest::new(a, [b], "hi"))
            .unwrap_err()
            .is_rejection());

        assert!(matches!(m.negotiate(a, b).unwrap(), NegotiationOutcome::Sent(_)));
        assert!(matches!(
            m.negotiate(a, b).unwrap(),
            NegotiationOutcome::Existing(_)
        ));

        let thread = m.accept(b, a).unwrap().unwrap();
        assert!(thread.closed);
        assert!(m.start_thread(ThreadRequest::new(a, [b], "hi")).is_ok());

        m.drain(ProcessMode::All, true).unwrap();
        let addresses: Vec<String> = outbox.take().into_iter().map(|e| e.to).collect();
        assert!(addresses.contains(&"b@example.com".to_string()));
        assert!(addresses.contains(&"a@example.com".to_string()));
    }

    #[test]
    fn test_answered_negotiation_is_terminal() {
        let (m, _) = setup(negotiating_config());
        let a = register(&m, "a");
        let b = register(&m, "b");
        let c = register(&m, "c");

        m.negotiate(a, b).unwrap();
        assert!(m.deny(b, a).unwrap());
        assert!(!m.deny(b, a).unwrap());
        assert!(m.accept(b, a).unwrap().is_none());

        m.negotiate(c, b).unwrap();
        assert!(m.accept(b, c).unwrap().is_some());
        assert!(!m.deny(b, c).unwrap());
    }
}

mod mail_tests {
    use super::*;

    #[test]
    fn test_repeat_notifications_merge() {
        let (m, _) = setup(CourierConfig::new());
        let a = register(&m, "a");
        let b = register(&m, "b");
        let thread = m
            .start_thread(ThreadRequest::new(a, [b], "t").body("first"))
            .unwrap()
            .thread;
        let before = m
            .store()
            .with_conn(|conn| {
                m.mail()
                    .find_pending(conn, &MailRecipient::User(b), NEW_MESSAGE_MAIL, false)
            })
            .unwrap()
            .unwrap();

        m.reply(a, thread.id, "second").unwrap();

        let after = m
            .store()
            .with_conn(|conn| {
                m.mail()
                    .find_pending(conn, &MailRecipient::User(b), NEW_MESSAGE_MAIL, false)
            })
            .unwrap()
            .unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.minimum_time, before.minimum_time);
        assert_eq!(after.values("message").len(), 2);
        assert_eq!(m.store().with_conn(|conn| m.mail().depth(conn, None)).unwrap(), 1);
    }

    #[test]
    fn test_payload_values_accumulate() {
        let (m, _) = setup(CourierConfig::new());
        let to = MailRecipient::Address("watcher@example.com".to_string());
        m.notify(to.clone(), "alerts.alert", json!({"k": [1]}), false).unwrap();
        m.notify(to.clone(), "alerts.alert", json!({"k": [2]}), false).unwrap();

        let pending = m.store().with_conn(|conn| m.mail().pending(conn)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].values("k"), &[json!(1), json!(2)]);
    }

    #[test]
    fn test_type_interval_delays_ordinary_drain() {
        let (m, outbox) = setup(CourierConfig::new());
        let to = MailRecipient::Address("watcher@example.com".to_string());
        m.notify(to, "alerts.alert", json!({"items": ["new listing"]}), false)
            .unwrap();

        let event = &m.store().with_conn(|conn| m.mail().pending(conn)).unwrap()[0];
        assert!(event.minimum_time >= event.created_at + chrono::Duration::minutes(60));

        assert_eq!(m.drain(ProcessMode::Ordinary, false).unwrap().sent, 0);
        assert_eq!(m.drain(ProcessMode::Ordinary, true).unwrap().sent, 1);
        assert_eq!(outbox.take()[0].text, "new listing");
    }

    #[test]
    fn test_user_rate_policy_and_bypass() {
        let (m, outbox) = setup(CourierConfig::new());
        let b = m
            .register_user(&NewUser::new("b").email("b@example.com").mail_interval(60))
            .unwrap()
            .id;

        m.notify(MailRecipient::User(b), "account.activation", json!({"link": "x"}), false)
            .unwrap();
        assert_eq!(m.drain(ProcessMode::Ordinary, false).unwrap().sent, 1);

        m.notify(MailRecipient::User(b), "account.activation", json!({"link": "y"}), false)
            .unwrap();
        let report = m.drain(ProcessMode::Ordinary, false).unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);

        assert_eq!(m.drain(ProcessMode::Ordinary, true).unwrap().sent, 1);
        assert_eq!(outbox.take().len(), 2);
    }

    #[test]
    fn test_present_user_loses_ordinary_mail() {
        let (m, _) = setup(CourierConfig::new());
        let b = register(&m, "b");
        m.notify(MailRecipient::User(b), "account.activation", json!({"link": "x"}), false)
            .unwrap();
        m.notify(MailRecipient::User(b), "account.activation", json!({"link": "x"}), true)
            .unwrap();

        assert_eq!(m.user_present(b).unwrap(), 1);
        assert_eq!(
            m.store().with_conn(|conn| m.mail().depth(conn, Some(true))).unwrap(),
            1
        );
    }

    #[test]
    fn test_failed_delivery_stays_sent() {
        let (m, outbox) = setup(CourierConfig::new());
        outbox.fail_for("ops@example.com");
        m.notify(
            MailRecipient::Address("ops@example.com".to_string()),
            "account.activation",
            json!({"link": "x"}),
            true,
        )
        .unwrap();

        let report = m.drain(ProcessMode::Forced, false).unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.has_failures());
        assert_eq!(m.store().with_conn(|conn| m.mail().depth(conn, None)).unwrap(), 0);
    }

    #[test]
    fn test_failed_delivery_requeues_when_configured() {
        let mut config = CourierConfig::new();
        config.mail.failure_policy = FailurePolicy::Requeue;
        let (m, outbox) = setup(config);
        outbox.fail_for("ops@example.com");
        m.notify(
            MailRecipient::Address("ops@example.com".to_string()),
            "account.activation",
            json!({"link": "x"}),
            true,
        )
        .unwrap();

        assert_eq!(m.drain(ProcessMode::Forced, false).unwrap().failed, 1);
        assert_eq!(m.store().with_conn(|conn| m.mail().depth(conn, None)).unwrap(), 1);
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_open_with_file_database_and_spool() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = CourierConfig::new();
        config.database = temp_dir.path().join("data").join("courier.db");
        config.transport = TransportConfig::Spool {
            dir: temp_dir.path().join("spool"),
        };
        let config_path = temp_dir.path().join("config.yaml");
        config.save(&config_path).unwrap();

        let loaded = CourierConfig::load(&config_path).unwrap();
        let m = Messenger::open(loaded).unwrap();
        m.notify(
            MailRecipient::Address("ops@example.com".to_string()),
            "account.activation",
            json!({"link": "x"}),
            true,
        )
        .unwrap();
        assert_eq!(m.drain(ProcessMode::Forced, false).unwrap().sent, 1);

        let spooled = std::fs::read_dir(temp_dir.path().join("spool")).unwrap().count();
        assert_eq!(spooled, 1);
    }
}
