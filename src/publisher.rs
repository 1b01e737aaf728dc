//! Event publisher tying the store, the logs and the subscriptions together.

use crate::error::{EvictionReason, Result, StreamError};
use crate::log::{Journal, JournalConfig, LogConfig, MutationLog};
use crate::snapshot::SnapshotMaterializer;
use crate::store::{Mutation, SnapshotSource, StateStore};
use crate::subscriptions::{
    CancelToken, SubscribeRequest, Subscription, SubscriptionConfig, SubscriptionParts,
    SubscriptionRegistry,
};
use crate::types::{Event, Index, Subject};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Publisher configuration.
#[derive(Clone, Debug, Default)]
pub struct PublisherConfig {
    /// Settings for every subject's mutation log.
    pub log: LogConfig,

    /// Settings handed to each new subscription.
    pub subscription: SubscriptionConfig,

    /// Durable journal (None = in-memory only).
    pub journal: Option<JournalConfig>,
}

/// Feed count below which idle feeds are never reaped.
const MIN_REAP_THRESHOLD: usize = 64;

/// Per-subject writer state.
struct Feed {
    /// Serializes writers of one subject so store order and log order agree.
    writer: Mutex<()>,
    log: Arc<MutationLog>,
}

/// Accepts writes, records them, and serves subscriptions.
///
/// Provides a unified interface for:
/// - Committing mutations to the state store
/// - Appending the resulting events to the subject's log (and journal)
/// - Waking subscribers and pruning consumed log entries
/// - Opening subscriptions that snapshot then stream
pub struct EventPublisher {
    config: PublisherConfig,
    store: Arc<StateStore>,
    materializer: Arc<SnapshotMaterializer>,
    registry: Arc<SubscriptionRegistry>,
    feeds: RwLock<HashMap<Subject, Arc<Feed>>>,
    /// Feed count at which the next insert reaps idle feeds first.
    reap_at: AtomicUsize,
    journal: Option<Journal>,
    closed: AtomicBool,
}

impl EventPublisher {
    /// Create a publisher over a fresh store, replaying the journal when
    /// one is configured.
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let store = Arc::new(StateStore::new());
        let source: Arc<dyn SnapshotSource> = store.clone();
        Self::build(config, store, source)
    }

    /// Create a publisher whose snapshots are read from `source` instead
    /// of from `store`.
    pub fn with_snapshot_source(
        config: PublisherConfig,
        store: Arc<StateStore>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        Self::build(config, store, source)
    }

    fn build(
        config: PublisherConfig,
        store: Arc<StateStore>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        let (journal, replayed) = match &config.journal {
            Some(journal_config) => {
                let (journal, events) = Journal::open(journal_config)?;
                (Some(journal), events)
            }
            None => (None, Vec::new()),
        };

        let publisher = Self {
            materializer: Arc::new(SnapshotMaterializer::new(source)),
            registry: Arc::new(SubscriptionRegistry::new()),
            feeds: RwLock::new(HashMap::new()),
            reap_at: AtomicUsize::new(MIN_REAP_THRESHOLD),
            store,
            journal,
            closed: AtomicBool::new(false),
            config,
        };

        let count = replayed.len();
        for event in replayed {
            publisher.store.restore(&event);
            let feed = publisher.feed(&event.subject());
            feed.log.append(event).map_err(|e| {
                StreamError::Corruption(format!("journal replay out of order: {}", e))
            })?;
        }
        if count > 0 {
            info!(
                events = count,
                last_index = publisher.store.last_index().0,
                "journal replayed"
            );
        }

        Ok(publisher)
    }

    fn feed(&self, subject: &Subject) -> Arc<Feed> {
        if let Some(feed) = self.feeds.read().get(subject) {
            return Arc::clone(feed);
        }

        let mut feeds = self.feeds.write();
        if !feeds.contains_key(subject) && feeds.len() >= self.reap_at.load(Ordering::Relaxed) {
            Self::reap_idle(&mut feeds);
            self.reap_at.store(
                (feeds.len() * 2).max(MIN_REAP_THRESHOLD),
                Ordering::Relaxed,
            );
        }
        Arc::clone(feeds.entry(subject.clone()).or_insert_with(|| {
            Arc::new(Feed {
                writer: Mutex::new(()),
                log: Arc::new(MutationLog::new(subject.clone(), self.config.log.clone())),
            })
        }))
    }

    /// Drop feeds created by subscriptions to subjects that were never
    /// written and are no longer in use.
    ///
    /// Feeds are only cloned under the map lock, so a feed whose `Arc`s
    /// are unshared here cannot be picked up concurrently.
    fn reap_idle(feeds: &mut HashMap<Subject, Arc<Feed>>) -> usize {
        let before = feeds.len();
        feeds.retain(|_, feed| {
            let idle = feed.log.tail() == Index::ZERO
                && feed.log.failure().is_none()
                && Arc::strong_count(feed) == 1
                && Arc::strong_count(&feed.log) == 1;
            !idle
        });
        let reaped = before - feeds.len();
        if reaped > 0 {
            debug!(reaped, remaining = feeds.len(), "idle feeds reaped");
        }
        reaped
    }

    // --- Writes ---

    /// Commit a mutation and publish the resulting event.
    ///
    /// On success the event is in the store, the journal (if any) and the
    /// subject's log, and subscribers have been woken. A journal or log
    /// failure poisons the subject: its subscribers are evicted and later
    /// writes and subscriptions to it fail.
    pub fn apply(&self, subject: &Subject, mutation: Mutation) -> Result<Event> {
        if self.is_shutdown() {
            return Err(StreamError::ShuttingDown);
        }

        let feed = self.feed(subject);
        let _writer = feed.writer.lock();

        if let Some(reason) = feed.log.failure() {
            return Err(StreamError::WriterAppendFailed(reason));
        }

        let event = self.store.commit(subject, mutation)?;

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event) {
                let reason = format!("journal append at index {} failed: {}", event.index, e);
                self.poison(subject, &feed, &reason);
                return Err(StreamError::WriterAppendFailed(reason));
            }
        }

        if let Err(e) = feed.log.append(event.clone()) {
            let reason = e.to_string();
            self.poison(subject, &feed, &reason);
            return Err(StreamError::WriterAppendFailed(reason));
        }

        let woken = self.registry.notify_append(subject);

        // Everything at or below the slowest live cursor has been consumed.
        let floor = self
            .registry
            .min_cursor(subject)
            .unwrap_or_else(|| feed.log.tail());
        let pruned = feed.log.prune_through(floor);

        debug!(
            subject = %subject,
            index = event.index.0,
            kind = ?event.kind,
            woken,
            pruned,
            "event published"
        );

        Ok(event)
    }

    /// Mark `subject` as failed after a write error outside the publisher.
    ///
    /// Its subscribers are evicted and later writes and subscriptions to it
    /// fail with `WriterAppendFailed`.
    pub fn fail_subject(&self, subject: &Subject, reason: impl Into<String>) {
        let feed = self.feed(subject);
        let _writer = feed.writer.lock();
        self.poison(subject, &feed, &reason.into());
    }

    fn poison(&self, subject: &Subject, feed: &Feed, reason: &str) {
        error!(subject = %subject, %reason, "write failed, evicting subscribers");
        feed.log.fail(reason);
        self.registry.evict_subject(subject, EvictionReason::LogFailed);
    }

    // --- Subscriptions ---

    /// Open a subscription for the request's subject.
    ///
    /// Fails before any event is produced if the subject's log has failed,
    /// the publisher is shutting down, `cancel` is already done, or the
    /// initial snapshot cannot be materialized.
    pub fn subscribe(&self, request: &SubscribeRequest, cancel: CancelToken) -> Result<Subscription> {
        if self.is_shutdown() {
            return Err(StreamError::ShuttingDown);
        }

        let subject = request.subject();
        let feed = self.feed(&subject);
        if let Some(reason) = feed.log.failure() {
            return Err(StreamError::WriterAppendFailed(reason));
        }

        let sub = Subscription::open(
            SubscriptionParts {
                subject,
                log: Arc::clone(&feed.log),
                materializer: Arc::clone(&self.materializer),
                registry: Arc::clone(&self.registry),
                config: self.config.subscription.clone(),
            },
            request.index,
            cancel,
        )?;

        debug!(
            subject = %sub.subject(),
            id = sub.id().0,
            snapshot_index = sub.snapshot_index().0,
            "subscription opened"
        );
        Ok(sub)
    }

    // --- Accessors ---

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The log of `subject`, if it has been written or is in use.
    pub fn log(&self, subject: &Subject) -> Option<Arc<MutationLog>> {
        self.feeds.read().get(subject).map(|f| Arc::clone(&f.log))
    }

    /// Highest index assigned by the store.
    pub fn last_index(&self) -> Index {
        self.store.last_index()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Flush the journal to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting writes and subscriptions and evict every live
    /// subscription. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let evicted = self.registry.close_all(EvictionReason::Shutdown);
        if let Err(e) = self.sync() {
            error!(error = %e, "journal sync on shutdown failed");
        }
        info!(evicted, "publisher shut down");
    }
}
