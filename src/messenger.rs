//! Application wiring
//!
//! [`Messenger`] assembles the store, the event bus with its subscribers, the
//! conversation components and the mail queue, and exposes the operations a
//! web layer or CLI calls. Each operation runs in one store transaction.

use crate::cache::UnreadCache;
use crate::config::CourierConfig;
use crate::events::{AuditLog, Event, EventBus, EventHandler, EventKind};
use crate::mail::{
    transport_from_config, DrainReport, MailDispatch, MailQueue, MailRecipient, MailTransport,
    MailTypeRegistry, ProcessMode,
};
use crate::messaging::{
    BlocklistGuard, ContentKind, ContentRegistry, DisableEffect, Message, MessageAppender,
    MessageId, NegotiationGuard, NegotiationOutcome, Negotiations, QuotaEnforcer, QuotaGuard,
    ReadReceipt, RecipientTracker, Thread, ThreadId, ThreadOutcome, ThreadRegistry, ThreadRequest,
    UserId,
};
use crate::store::{users, NewUser, Store, User};
use crate::{CourierError, Result};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Builder for [`Messenger`]
pub struct MessengerBuilder {
    store: Arc<Store>,
    config: CourierConfig,
    transport: Option<Arc<dyn MailTransport>>,
    handlers: Vec<(Vec<EventKind>, Arc<dyn EventHandler>)>,
    content: ContentRegistry,
}

impl MessengerBuilder {
    /// Deliver through `transport` instead of the configured one
    pub fn transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Subscribe an extra handler, after the built-in ones
    pub fn handler(mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push((kinds.to_vec(), handler));
        self
    }

    /// Resolve thread subjects of an application-defined kind
    pub fn content_loader<F>(mut self, kind: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&Connection, i64) -> Result<bool> + Send + Sync + 'static,
    {
        self.content.register(ContentKind::External(kind.into()), loader);
        self
    }

    pub fn build(self) -> Result<Messenger> {
        let config = self.config;
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport_from_config(&config.transport)?,
        };

        let mail = Arc::new(MailQueue::new(
            MailTypeRegistry::from_config(&config.mail_types),
            config.mail.clone(),
            transport,
        ));
        let recipients = RecipientTracker::new(Arc::new(UnreadCache::new(
            config.messaging.unread_cache_ttl(),
        )));
        let quota = QuotaEnforcer::new(config.quota.clone());

        let mut bus = EventBus::builder()
            .subscribe(EventKind::ThreadPreCreate, Arc::new(QuotaGuard::new(quota.clone())));
        if config.messaging.blacklist_enabled {
            bus = bus.subscribe_all(
                &[EventKind::ThreadPreCreate, EventKind::MessagePreSend],
                Arc::new(BlocklistGuard),
            );
        }
        if config.messaging.require_negotiation {
            bus = bus.subscribe(EventKind::ThreadPreCreate, Arc::new(NegotiationGuard));
        }
        bus = bus
            .subscribe(EventKind::Mailable, Arc::new(MailDispatch::new(mail.clone())))
            .subscribe(EventKind::ThreadRead, Arc::new(ReadReceipt::new(recipients.clone())))
            .subscribe_all(&AuditLog::KINDS, Arc::new(AuditLog));
        for (kinds, handler) in self.handlers {
            bus = bus.subscribe_all(&kinds, handler);
        }
        let bus = Arc::new(bus.build());

        let appender = MessageAppender::new(
            bus.clone(),
            recipients.clone(),
            config.messaging.blacklist_enabled,
        );
        let threads = ThreadRegistry::new(
            config.messaging.clone(),
            bus.clone(),
            recipients.clone(),
            appender,
            self.content,
        );
        let negotiations = Negotiations::new(
            config.messaging.clone(),
            bus.clone(),
            threads.clone(),
            quota.clone(),
        );

        tracing::debug!(bus = ?bus, "Messenger assembled");

        Ok(Messenger {
            store: self.store,
            config,
            bus,
            recipients,
            threads,
            negotiations,
            quota,
            mail,
        })
    }
}

/// The conversation engine and its mail queue
pub struct Messenger {
    store: Arc<Store>,
    config: CourierConfig,
    bus: Arc<EventBus>,
    recipients: RecipientTracker,
    threads: ThreadRegistry,
    negotiations: Negotiations,
    quota: QuotaEnforcer,
    mail: Arc<MailQueue>,
}

impl Messenger {
    pub fn builder(store: Arc<Store>, config: CourierConfig) -> MessengerBuilder {
        MessengerBuilder {
            store,
            config,
            transport: None,
            handlers: Vec::new(),
            content: ContentRegistry::with_builtin(),
        }
    }

    /// Open the configured database and wire everything with defaults
    pub fn open(config: CourierConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.database)?);
        Self::builder(store, config).build()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn recipients(&self) -> &RecipientTracker {
        &self.recipients
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn negotiations(&self) -> &Negotiations {
        &self.negotiations
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    pub fn mail(&self) -> &Arc<MailQueue> {
        &self.mail
    }

    // Users

    pub fn register_user(&self, new: &NewUser) -> Result<User> {
        self.store.transaction(|tx| users::insert_user(tx, new))
    }

    pub fn user(&self, id: UserId) -> Result<User> {
        self.store.with_conn(|conn| users::require_user(conn, id))
    }

    /// `owner` stops accepting contact from `blocked`
    pub fn block(&self, owner: UserId, blocked: UserId) -> Result<()> {
        if owner == blocked {
            return Err(CourierError::InvalidArgument(
                "cannot block yourself".to_string(),
            ));
        }
        self.store.transaction(|tx| users::block(tx, owner, blocked))
    }

    pub fn unblock(&self, owner: UserId, blocked: UserId) -> Result<()> {
        self.store.transaction(|tx| users::unblock(tx, owner, blocked))
    }

    /// Daily caps for members of `group`
    pub fn set_group_quota(&self, group: &str, max_threads: u32, max_negotiations: u32) -> Result<()> {
        self.store
            .transaction(|tx| users::set_group_quota(tx, group, max_threads, max_negotiations))
    }

    /// Stop (or resume) ordinary mail to `user`; forced mail is unaffected
    pub fn set_opt_out(&self, user: UserId, opt_out: bool) -> Result<()> {
        self.store.transaction(|tx| users::set_opt_out(tx, user, opt_out))
    }

    /// The user is on the site: their pending non-forced mail is moot
    pub fn user_present(&self, user: UserId) -> Result<usize> {
        self.store.transaction(|tx| self.mail.discard(tx, user))
    }

    // Threads

    pub fn start_thread(&self, request: ThreadRequest) -> Result<ThreadOutcome> {
        self.store
            .transaction(|tx| self.threads.find_or_create(tx, request))
    }

    /// Whether `start_thread` would pass validation; writes nothing
    pub fn simulate(
        &self,
        author: UserId,
        recipients: &BTreeSet<UserId>,
        unique: Option<bool>,
        force: bool,
    ) -> Result<bool> {
        self.store
            .with_conn(|conn| self.threads.simulate(conn, author, recipients, unique, force))
    }

    pub fn reply(&self, author: UserId, thread: ThreadId, body: &str) -> Result<Message> {
        self.store
            .transaction(|tx| self.threads.appender().append(tx, Some(author), thread, body))
    }

    /// Post a message with no author
    pub fn system_message(&self, thread: ThreadId, body: &str) -> Result<Message> {
        self.store
            .transaction(|tx| self.threads.appender().append(tx, None, thread, body))
    }

    /// `user` opens the thread: it is marked read and acknowledged
    pub fn open_thread(&self, user: UserId, thread: ThreadId) -> Result<(Thread, Vec<Message>)> {
        self.store.transaction(|tx| {
            let thread = self.threads.check_access(tx, thread, user)?;
            self.recipients.set_read(tx, thread.id, Some(user))?;
            self.bus.notify(
                tx,
                &Event::ThreadRead {
                    user,
                    thread: thread.id,
                },
            )?;
            let messages = self.threads.appender().list(tx, thread.id, false)?;
            Ok((thread, messages))
        })
    }

    pub fn mark_unread(&self, user: UserId, thread: ThreadId) -> Result<bool> {
        self.store
            .transaction(|tx| self.recipients.set_unread(tx, thread, user))
    }

    pub fn leave_thread(&self, user: UserId, thread: ThreadId) -> Result<DisableEffect> {
        self.store
            .transaction(|tx| self.recipients.disable(tx, thread, user))
    }

    pub fn invite(&self, actor: UserId, thread: ThreadId, user: UserId) -> Result<()> {
        self.store
            .transaction(|tx| self.threads.add_participant(tx, thread, user, actor))
    }

    pub fn set_closed(&self, actor: UserId, thread: ThreadId, desired: Option<bool>) -> Result<bool> {
        self.store
            .transaction(|tx| self.threads.set_closed(tx, thread, desired, actor))
    }

    /// Delete a thread on behalf of its author or staff
    pub fn delete_thread(&self, actor: UserId, thread: ThreadId, clear: bool) -> Result<()> {
        self.store.transaction(|tx| {
            let target = self.threads.get(tx, thread)?;
            let user = users::require_user(tx, actor)?;
            if !user.is_privileged() && target.author != Some(actor) {
                return Err(CourierError::PermissionDenied(format!(
                    "user {} may not delete thread {}",
                    actor, thread
                )));
            }
            self.threads.delete(tx, thread, clear)
        })
    }

    /// Delete threads untouched for `days`
    pub fn prune(&self, days: u32, only_closed_or_deleted: bool, clear: bool) -> Result<usize> {
        self.store.transaction(|tx| {
            self.threads
                .delete_older_than(tx, days, only_closed_or_deleted, clear)
        })
    }

    pub fn inbox(&self, user: UserId, include_closed: bool) -> Result<Vec<Thread>> {
        self.store
            .with_conn(|conn| self.threads.inbox(conn, user, include_closed))
    }

    pub fn unread_count(&self, user: UserId) -> Result<usize> {
        self.store
            .with_conn(|conn| self.recipients.unread_count(conn, user))
    }

    pub fn unacknowledged_count(&self, user: UserId) -> Result<usize> {
        self.store
            .with_conn(|conn| self.recipients.unacknowledged_count(conn, user))
    }

    // Messages

    pub fn delete_message(&self, actor: UserId, message: MessageId) -> Result<Message> {
        self.store
            .transaction(|tx| self.threads.appender().delete_message(tx, message, actor))
    }

    pub fn undelete_message(&self, actor: UserId, message: MessageId) -> Result<Message> {
        self.store
            .transaction(|tx| self.threads.appender().undelete_message(tx, message, actor))
    }

    pub fn set_spam_score(&self, message: MessageId, score: f64) -> Result<()> {
        self.store
            .transaction(|tx| self.threads.appender().set_spam_score(tx, message, score))
    }

    // Quotas

    pub fn exceeded_threads(&self, user: UserId) -> Result<bool> {
        self.store.with_conn(|conn| {
            let user = users::require_user(conn, user)?;
            self.quota.exceeded_threads(conn, &user)
        })
    }

    pub fn exceeded_negotiations(&self, user: UserId) -> Result<bool> {
        self.store.with_conn(|conn| {
            let user = users::require_user(conn, user)?;
            self.quota.exceeded_negotiations(conn, &user)
        })
    }

    // Negotiations

    pub fn negotiate(&self, source: UserId, target: UserId) -> Result<NegotiationOutcome> {
        self.store
            .transaction(|tx| self.negotiations.negotiate(tx, source, target))
    }

    pub fn accept(&self, acceptor: UserId, requester: UserId) -> Result<Option<Thread>> {
        self.store
            .transaction(|tx| self.negotiations.accept(tx, acceptor, requester))
    }

    pub fn deny(&self, denier: UserId, requester: UserId) -> Result<bool> {
        self.store
            .transaction(|tx| self.negotiations.deny(tx, denier, requester))
    }

    // Mail

    /// Queue a notification through the event bus
    pub fn notify(
        &self,
        recipient: MailRecipient,
        mail_type: &str,
        data: serde_json::Value,
        forced: bool,
    ) -> Result<()> {
        if !self.mail.registry().contains(mail_type) {
            return Err(CourierError::UnknownMailType(mail_type.to_string()));
        }
        self.store.transaction(|tx| {
            self.bus.notify(
                tx,
                &Event::Mailable {
                    mail_type: mail_type.to_string(),
                    recipient,
                    data,
                    forced,
                },
            )
        })
    }

    pub fn drain(&self, mode: ProcessMode, bypass_delay: bool) -> Result<DrainReport> {
        self.mail.process(&self.store, mode, bypass_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Verdict;
    use crate::mail::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl EventHandler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn handle(&self, _conn: &Connection, _event: &Event) -> Result<Verdict> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Verdict::Accept)
        }
    }

    fn messenger_with_counter() -> (Messenger, Arc<Counter>) {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let messenger = Messenger::builder(Arc::new(Store::in_memory().unwrap()), CourierConfig::new())
            .transport(Arc::new(MemoryTransport::new()))
            .handler(&[EventKind::MessageSent], counter.clone())
            .build()
            .unwrap();
        (messenger, counter)
    }

    #[test]
    fn test_wiring_subscribes_builtin_handlers() {
        let (m, _) = messenger_with_counter();
        assert_eq!(m.bus().handler_count(EventKind::ThreadPreCreate), 2);
        assert_eq!(m.bus().handler_count(EventKind::MessagePreSend), 1);
        assert_eq!(m.bus().handler_count(EventKind::Mailable), 1);
        assert_eq!(m.bus().handler_count(EventKind::MessageSent), 2);
    }

    #[test]
    fn test_extra_handler_sees_events() {
        let (m, counter) = messenger_with_counter();
        let a = m.register_user(&NewUser::new("a")).unwrap().id;
        let b = m.register_user(&NewUser::new("b")).unwrap().id;
        let outcome = m
            .start_thread(ThreadRequest::new(a, [b], "hi").body("hello"))
            .unwrap();
        m.reply(b, outcome.thread.id, "hey").unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_open_thread_reads_and_acknowledges() {
        let (m, _) = messenger_with_counter();
        let a = m.register_user(&NewUser::new("a")).unwrap().id;
        let b = m.register_user(&NewUser::new("b")).unwrap().id;
        let thread = m
            .start_thread(ThreadRequest::new(a, [b], "hi").body("hello"))
            .unwrap()
            .thread;
        assert_eq!(m.unread_count(b).unwrap(), 1);
        assert_eq!(m.unacknowledged_count(b).unwrap(), 1);

        let (_, messages) = m.open_thread(b, thread.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(m.unread_count(b).unwrap(), 0);
        assert_eq!(m.unacknowledged_count(b).unwrap(), 0);
    }

    #[test]
    fn test_delete_thread_permissions() {
        let (m, _) = messenger_with_counter();
        let a = m.register_user(&NewUser::new("a")).unwrap().id;
        let b = m.register_user(&NewUser::new("b")).unwrap().id;
        let thread = m.start_thread(ThreadRequest::new(a, [b], "hi")).unwrap().thread;

        assert!(m.delete_thread(b, thread.id, false).unwrap_err().is_permission_denied());
        m.delete_thread(a, thread.id, false).unwrap();
        assert!(m.inbox(a, true).unwrap().is_empty());
    }

    #[test]
    fn test_prune_rejects_out_of_range_age() {
        let (m, _) = messenger_with_counter();
        let a = m.register_user(&NewUser::new("a")).unwrap().id;
        let b = m.register_user(&NewUser::new("b")).unwrap().id;
        m.start_thread(ThreadRequest::new(a, [b], "hi").body("hello")).unwrap();

        let err = m.prune(200_000_000, false, false).unwrap_err();
        assert!(matches!(err, CourierError::InvalidArgument(_)));

        // The store stays usable afterwards.
        assert_eq!(m.unread_count(b).unwrap(), 1);
        assert_eq!(m.prune(30, false, false).unwrap(), 0);
    }

    #[test]
    fn test_notify_unknown_type() {
        let (m, _) = messenger_with_counter();
        let err = m
            .notify(
                MailRecipient::Address("x@example.com".to_string()),
                "nope",
                serde_json::json!({}),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, CourierError::UnknownMailType(_)));
    }
}
