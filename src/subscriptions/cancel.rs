//! Cancellation tokens and the blocking wait used by streaming readers.

use super::registry::WatchState;
use crate::error::{Result, StreamError};
use crossbeam_channel::{after, at, bounded, never, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct CancelInner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `signal` for every waiter.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn new(deadline: Option<Instant>) -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            signal,
            deadline,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.trigger.lock().take();

        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// Caller-controlled cancellation with an optional deadline.
///
/// Clones share one state: cancelling any clone cancels all of them.
/// [`CancelToken::child`] derives a token that is cancelled with its parent
/// but can also be cancelled on its own.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// A token without deadline.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner::new(None)),
        }
    }

    /// A token whose deadline passes `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(CancelInner::new(Some(deadline))),
        }
    }

    /// Derive a token cancelled together with this one.
    ///
    /// The child inherits the deadline. Cancelling the child leaves the
    /// parent untouched.
    pub fn child(&self) -> CancelToken {
        let child = Arc::new(CancelInner::new(self.inner.deadline));
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled before the child was linked.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        }
        CancelToken { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why this token is done, if it is.
    ///
    /// Explicit cancellation takes precedence over an expired deadline.
    pub fn error(&self) -> Option<StreamError> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(StreamError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StreamError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }

    /// `Err` with the cancellation cause once the token is done.
    pub fn check(&self) -> Result<()> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Channel that disconnects when the token is cancelled. Meant for
    /// `select!`; nothing is ever sent on it.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Channel that fires once at the deadline, or never.
    pub fn deadline_timer(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Suspends a caught-up reader until there may be more to read.
///
/// A wait ends on a wake from the registry, on cancellation, at the
/// deadline, or after `poll_interval` as a fallback tick.
pub struct Waiter {
    wake: Receiver<()>,
    cancel: CancelToken,
    watch: Arc<WatchState>,
    poll_interval: Duration,
}

impl Waiter {
    pub(crate) fn new(
        wake: Receiver<()>,
        cancel: CancelToken,
        watch: Arc<WatchState>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            wake,
            cancel,
            watch,
            poll_interval,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail if the reader was cancelled or evicted.
    pub fn check(&self) -> Result<()> {
        self.cancel.check()?;
        match self.watch.eviction() {
            Some(reason) => Err(StreamError::Evicted(reason)),
            None => Ok(()),
        }
    }

    /// Block until woken, then re-check for cancellation and eviction.
    pub fn wait(&self) -> Result<()> {
        let deadline = self.cancel.deadline_timer();
        let connected = select! {
            recv(self.cancel.signal()) -> _ => true,
            recv(deadline) -> _ => true,
            recv(self.wake) -> msg => msg.is_ok(),
            recv(after(self.poll_interval)) -> _ => true,
        };

        self.check()?;
        if !connected {
            // The registry dropped our wake handle without recording why.
            return Err(StreamError::SubscriptionClosed);
        }
        Ok(())
    }
}
