//! Registry of live subscriptions and append fan-out.

use super::types::SubscriptionId;
use crate::error::{EvictionReason, Result, StreamError};
use crate::types::{Index, Subject};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// State shared between a subscription and its registry entry.
pub struct WatchState {
    /// Last index delivered (or the snapshot index while snapshotting).
    cursor: AtomicU64,
    eviction: Mutex<Option<EvictionReason>>,
}

impl WatchState {
    pub(crate) fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
            eviction: Mutex::new(None),
        }
    }

    pub fn cursor(&self) -> Index {
        Index(self.cursor.load(Ordering::SeqCst))
    }

    pub(crate) fn set_cursor(&self, index: Index) {
        self.cursor.store(index.0, Ordering::SeqCst);
    }

    pub fn eviction(&self) -> Option<EvictionReason> {
        *self.eviction.lock()
    }

    fn evict(&self, reason: EvictionReason) {
        let mut eviction = self.eviction.lock();
        if eviction.is_none() {
            *eviction = Some(reason);
        }
    }
}

/// Returned by [`SubscriptionRegistry::register`].
pub struct Registration {
    pub id: SubscriptionId,
    /// Receives a token whenever the subject's log grows. Tokens coalesce,
    /// so one wake may stand for several appends. Disconnects on eviction.
    pub wake: Receiver<()>,
    pub watch: Arc<WatchState>,
}

struct WakeHandle {
    waker: Sender<()>,
    watch: Arc<WatchState>,
}

#[derive(Default)]
struct SubjectWatchers {
    handles: HashMap<SubscriptionId, WakeHandle>,
}

/// Tracks live subscriptions per subject and wakes them on append.
///
/// Registrations and notifications on different subjects rarely contend.
pub struct SubscriptionRegistry {
    watchers: DashMap<Subject, SubjectWatchers>,
    next_id: AtomicU64,
    count: AtomicUsize,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new subscription on `subject`.
    ///
    /// Its cursor starts at zero, pinning the whole log until the
    /// subscriber reports a position.
    pub fn register(&self, subject: &Subject) -> Result<Registration> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let watch = Arc::new(WatchState::new());
        let (waker, wake) = bounded(1);
        let handle = WakeHandle {
            waker,
            watch: Arc::clone(&watch),
        };

        // The closed check and the insert share the entry lock, so a
        // concurrent `close_all` either sees the handle or refuses it.
        let inserted = {
            let mut set = self.watchers.entry(subject.clone()).or_default();
            self.insert(&mut set, id, handle)
        };
        if let Err(e) = inserted {
            self.watchers.remove_if(subject, |_, set| set.handles.is_empty());
            return Err(e);
        }

        debug!(subject = %subject, id = id.0, "subscription registered");
        Ok(Registration { id, wake, watch })
    }

    fn insert(&self, set: &mut SubjectWatchers, id: SubscriptionId, handle: WakeHandle) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }
        set.handles.insert(id, handle);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unregister(&self, subject: &Subject, id: SubscriptionId) -> bool {
        let removed = match self.watchers.get_mut(subject) {
            Some(mut set) => set.handles.remove(&id).is_some(),
            None => return false,
        };
        self.watchers.remove_if(subject, |_, set| set.handles.is_empty());

        if removed {
            self.count.fetch_sub(1, Ordering::SeqCst);
            debug!(subject = %subject, id = id.0, "subscription unregistered");
        }
        removed
    }

    /// Wake every subscription on `subject`. Never blocks on a slow
    /// subscriber. Returns the number of subscriptions on the subject.
    pub fn notify_append(&self, subject: &Subject) -> usize {
        let Some(set) = self.watchers.get(subject) else {
            return 0;
        };

        for handle in set.handles.values() {
            match handle.waker.try_send(()) {
                // A pending wake already covers this append.
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {}
            }
        }
        set.handles.len()
    }

    /// Lowest cursor among subscriptions on `subject`.
    pub fn min_cursor(&self, subject: &Subject) -> Option<Index> {
        let set = self.watchers.get(subject)?;
        set.handles.values().map(|h| h.watch.cursor()).min()
    }

    /// Forcibly close every subscription on `subject`.
    pub fn evict_subject(&self, subject: &Subject, reason: EvictionReason) -> usize {
        match self.watchers.remove(subject) {
            Some((_, set)) => self.evict(set.handles, reason),
            None => 0,
        }
    }

    /// Refuse new registrations and evict every subscription.
    pub fn close_all(&self, reason: EvictionReason) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let mut evicted = 0;
        self.watchers.retain(|_, set| {
            evicted += self.evict(std::mem::take(&mut set.handles), reason);
            false
        });

        info!(evicted, %reason, "subscription registry closed");
        evicted
    }

    fn evict(&self, handles: HashMap<SubscriptionId, WakeHandle>, reason: EvictionReason) -> usize {
        let n = handles.len();
        for (_, handle) in handles {
            // Reason first: the subscriber reads it once the wake channel
            // disconnects.
            handle.watch.evict(reason);
            drop(handle.waker);
        }
        self.count.fetch_sub(n, Ordering::SeqCst);
        n
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Live subscriptions across all subjects.
    pub fn subscription_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Live subscriptions on one subject.
    pub fn subject_count(&self, subject: &Subject) -> usize {
        self.watchers
            .get(subject)
            .map(|set| set.handles.len())
            .unwrap_or(0)
    }

    /// Subjects with at least one live subscription.
    pub fn watched_subjects(&self) -> usize {
        self.watchers.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Topic;
    use crossbeam_channel::TryRecvError;

    fn subject(key: &str) -> Subject {
        Subject::new(Topic::ServiceHealth, key)
    }

    #[test]
    fn test_register_unregister() {
        let registry = SubscriptionRegistry::new();

        let reg = registry.register(&subject("redis")).unwrap();
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.subject_count(&subject("redis")), 1);

        assert!(registry.unregister(&subject("redis"), reg.id));
        assert_eq!(registry.subscription_count(), 0);

        // Idempotent.
        assert!(!registry.unregister(&subject("redis"), reg.id));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_notify_wakes_only_matching_subject() {
        let registry = SubscriptionRegistry::new();
        let redis = registry.register(&subject("redis")).unwrap();
        let web = registry.register(&subject("web")).unwrap();

        assert_eq!(registry.notify_append(&subject("redis")), 1);

        assert!(redis.wake.try_recv().is_ok());
        assert!(matches!(web.wake.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_wakes_coalesce() {
        let registry = SubscriptionRegistry::new();
        let reg = registry.register(&subject("redis")).unwrap();

        for _ in 0..100 {
            registry.notify_append(&subject("redis"));
        }

        assert!(reg.wake.try_recv().is_ok());
        assert!(matches!(reg.wake.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_min_cursor() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.min_cursor(&subject("redis")), None);

        let a = registry.register(&subject("redis")).unwrap();
        let b = registry.register(&subject("redis")).unwrap();
        assert_eq!(registry.min_cursor(&subject("redis")), Some(Index::ZERO));

        a.watch.set_cursor(Index(10));
        b.watch.set_cursor(Index(7));
        assert_eq!(registry.min_cursor(&subject("redis")), Some(Index(7)));

        registry.unregister(&subject("redis"), b.id);
        assert_eq!(registry.min_cursor(&subject("redis")), Some(Index(10)));
    }

    #[test]
    fn test_evict_subject_disconnects_with_reason() {
        let registry = SubscriptionRegistry::new();
        let reg = registry.register(&subject("redis")).unwrap();
        let other = registry.register(&subject("web")).unwrap();

        assert_eq!(registry.evict_subject(&subject("redis"), EvictionReason::LogFailed), 1);

        assert_eq!(reg.watch.eviction(), Some(EvictionReason::LogFailed));
        assert!(matches!(reg.wake.try_recv(), Err(TryRecvError::Disconnected)));
        assert!(other.watch.eviction().is_none());
        assert_eq!(registry.subscription_count(), 1);

        // Unregistering an evicted subscription is a no-op.
        assert!(!registry.unregister(&subject("redis"), reg.id));
    }

    #[test]
    fn test_empty_subjects_are_dropped() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register(&subject("redis")).unwrap();
        let b = registry.register(&subject("redis")).unwrap();
        let web = registry.register(&subject("web")).unwrap();
        assert_eq!(registry.watched_subjects(), 2);

        registry.unregister(&subject("redis"), a.id);
        assert_eq!(registry.watched_subjects(), 2);
        registry.unregister(&subject("redis"), b.id);
        assert_eq!(registry.watched_subjects(), 1);

        registry.evict_subject(&subject("web"), EvictionReason::LogFailed);
        assert_eq!(registry.watched_subjects(), 0);
        assert_eq!(web.watch.eviction(), Some(EvictionReason::LogFailed));
    }

    #[test]
    fn test_concurrent_register_across_subjects() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let key = format!("svc{}", t % 3);
                    for _ in 0..50 {
                        let reg = registry.register(&subject(&key)).unwrap();
                        registry.notify_append(&subject(&key));
                        assert!(registry.unregister(&subject(&key), reg.id));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.watched_subjects(), 0);
    }

    #[test]
    fn test_close_all_refuses_new_registrations() {
        let registry = SubscriptionRegistry::new();
        let a = registry.register(&subject("redis")).unwrap();
        let b = registry.register(&subject("web")).unwrap();

        assert_eq!(registry.close_all(EvictionReason::Shutdown), 2);
        assert_eq!(a.watch.eviction(), Some(EvictionReason::Shutdown));
        assert_eq!(b.watch.eviction(), Some(EvictionReason::Shutdown));
        assert_eq!(registry.subscription_count(), 0);

        assert!(matches!(
            registry.register(&subject("redis")),
            Err(StreamError::ShuttingDown)
        ));
        assert_eq!(registry.watched_subjects(), 0);
    }
}
