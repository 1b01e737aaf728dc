//! Per-subscriber state machine: snapshot, then stream.

use super::cancel::{CancelToken, Waiter};
use super::registry::{SubscriptionRegistry, WatchState};
use super::types::{SubscriptionConfig, SubscriptionId, SubscriptionState};
use crate::error::{EvictionReason, Result, StreamError};
use crate::log::{MutationLog, Since};
use crate::snapshot::SnapshotMaterializer;
use crate::types::{Event, Index, Subject};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a subscription needs from its publisher.
pub(crate) struct SubscriptionParts {
    pub subject: Subject,
    pub log: Arc<MutationLog>,
    pub materializer: Arc<SnapshotMaterializer>,
    pub registry: Arc<SubscriptionRegistry>,
    pub config: SubscriptionConfig,
}

/// One subscriber's view of a subject.
///
/// Delivers the snapshot (entries, then `EndOfSnapshot`), then every log
/// event with index above the snapshot index, in order, without gaps or
/// duplicates. When the log no longer holds what the subscriber needs it
/// emits `NewSnapshotToFollow` and starts over with a fresh snapshot.
///
/// Dropping a subscription unregisters it.
pub struct Subscription {
    id: SubscriptionId,
    subject: Subject,
    state: SubscriptionState,
    /// Snapshot events not yet handed out.
    pending: VecDeque<Event>,
    snapshot_index: Index,
    stream: Option<Since>,
    log: Arc<MutationLog>,
    materializer: Arc<SnapshotMaterializer>,
    registry: Arc<SubscriptionRegistry>,
    watch: Arc<WatchState>,
    waiter: Waiter,
    config: SubscriptionConfig,
    /// Resnapshots since the last streamed event.
    resnapshots: u32,
}

impl Subscription {
    /// Register and prepare the first batch of events.
    ///
    /// With `resume` set and still served by the log, streaming starts
    /// right after it. Otherwise a snapshot is materialized, preceded by
    /// `NewSnapshotToFollow` when a resume was asked for.
    pub(crate) fn open(
        parts: SubscriptionParts,
        resume: Option<Index>,
        cancel: CancelToken,
    ) -> Result<Self> {
        cancel.check()?;

        let registration = parts.registry.register(&parts.subject)?;
        let waiter = Waiter::new(
            registration.wake,
            cancel,
            Arc::clone(&registration.watch),
            parts.config.poll_interval,
        );

        let mut sub = Subscription {
            id: registration.id,
            subject: parts.subject,
            state: SubscriptionState::Snapshotting,
            pending: VecDeque::new(),
            snapshot_index: Index::ZERO,
            stream: None,
            log: parts.log,
            materializer: parts.materializer,
            registry: parts.registry,
            watch: registration.watch,
            waiter,
            config: parts.config,
            resnapshots: 0,
        };

        match resume {
            Some(index) => {
                // Pin the log at the resume point before checking it.
                sub.watch.set_cursor(index);
                if sub.log.can_resume_from(index) {
                    debug!(subject = %sub.subject, id = sub.id.0, index = index.0, "resuming from index");
                    sub.start_streaming(index);
                } else {
                    debug!(subject = %sub.subject, id = sub.id.0, index = index.0, "cannot resume, resnapshotting");
                    sub.pending
                        .push_back(Event::new_snapshot_to_follow(&sub.subject, index));
                    sub.load_snapshot()?;
                }
            }
            None => sub.load_snapshot()?,
        }

        Ok(sub)
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Index of the most recent snapshot.
    pub fn snapshot_index(&self) -> Index {
        self.snapshot_index
    }

    /// Last index handed out, or the snapshot index while snapshotting.
    pub fn cursor(&self) -> Index {
        self.watch.cursor()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.waiter.cancel_token()
    }

    /// Why the server side closed this subscription, if it did.
    pub fn eviction(&self) -> Option<EvictionReason> {
        self.watch.eviction()
    }

    fn load_snapshot(&mut self) -> Result<()> {
        let snapshot = self.materializer.materialize(&self.subject)?;
        self.snapshot_index = snapshot.index;
        self.watch.set_cursor(snapshot.index);
        self.pending.extend(snapshot.events);
        self.state = SubscriptionState::Snapshotting;
        self.stream = None;
        Ok(())
    }

    fn start_streaming(&mut self, after: Index) {
        self.watch.set_cursor(after);
        self.stream = Some(self.log.since(after));
        self.state = SubscriptionState::Streaming;
    }

    /// Next event for the subscriber, blocking while caught up.
    ///
    /// Any error closes the subscription; later calls return
    /// `SubscriptionClosed`.
    pub fn next_event(&mut self) -> Result<Event> {
        if self.state == SubscriptionState::Closed {
            return Err(StreamError::SubscriptionClosed);
        }

        let result = self.advance();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn advance(&mut self) -> Result<Event> {
        // Checked before handing out anything, including buffered snapshot
        // events.
        self.waiter.check()?;

        loop {
            if self.state == SubscriptionState::Snapshotting {
                if let Some(event) = self.pending.pop_front() {
                    if event.is_end_of_snapshot() {
                        self.start_streaming(event.index);
                    }
                    return Ok(event);
                }
                // A snapshot always ends with its marker, so this is only
                // reached if the buffer was cleared.
                return Err(StreamError::SubscriptionClosed);
            }

            let stream = self.stream.as_mut().ok_or(StreamError::SubscriptionClosed)?;
            match stream.next_blocking(&self.waiter) {
                Ok(event) => {
                    self.watch.set_cursor(event.index);
                    self.resnapshots = 0;
                    return Ok(event);
                }
                Err(StreamError::CursorTooOld { oldest, requested }) => {
                    self.resnapshots += 1;
                    if let Some(max) = self.config.max_resnapshots {
                        if self.resnapshots > max {
                            warn!(
                                subject = %self.subject,
                                id = self.id.0,
                                resnapshots = self.resnapshots,
                                "too many resnapshots, giving up"
                            );
                            return Err(StreamError::CursorTooOld { oldest, requested });
                        }
                    }
                    warn!(
                        subject = %self.subject,
                        id = self.id.0,
                        requested = requested.0,
                        oldest = oldest.0,
                        "subscriber fell behind the log, resnapshotting"
                    );
                    self.pending
                        .push_back(Event::new_snapshot_to_follow(&self.subject, requested));
                    self.load_snapshot()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop delivering and unregister. Idempotent.
    pub fn close(&mut self) {
        if self.state == SubscriptionState::Closed {
            return;
        }
        self.state = SubscriptionState::Closed;
        self.pending.clear();
        self.stream = None;
        self.registry.unregister(&self.subject, self.id);
        debug!(subject = %self.subject, id = self.id.0, "subscription closed");
    }
}

impl Iterator for Subscription {
    type Item = Result<Event>;

    /// Yields events until the first error, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.state == SubscriptionState::Closed {
            return None;
        }
        Some(self.next_event())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
