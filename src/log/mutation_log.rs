//! Append-only, indexed log of change events for one subject.

use crate::error::{Result, StreamError};
use crate::subscriptions::Waiter;
use crate::types::{Event, Index, Subject};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

/// Retention and read settings for mutation logs.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Hard cap on retained entries. When exceeded the oldest entry is
    /// evicted even if a subscriber still needs it; that subscriber then
    /// observes `CursorTooOld` and resnapshots.
    /// Default: 4096
    pub max_retained: usize,

    /// Max events copied out of the log per read.
    /// Default: 128
    pub read_batch: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_retained: 4096,
            read_batch: 128,
        }
    }
}

struct LogState {
    /// Retained events, ordered by index.
    entries: VecDeque<Event>,
    /// Index of the last appended event.
    tail: Index,
    /// Highest index ever removed from `entries`.
    pruned_through: Index,
    /// Set once an append failed; the log accepts nothing afterwards.
    failure: Option<String>,
}

/// Append-only mutation log for a single subject.
///
/// Appends are serialized by the caller (one writer per subject). The
/// entry and the new tail become visible under one write lock, so no
/// reader can observe index N before N-1.
pub struct MutationLog {
    subject: Subject,
    config: LogConfig,
    state: RwLock<LogState>,
}

impl MutationLog {
    /// Create an empty log.
    pub fn new(subject: Subject, config: LogConfig) -> Self {
        Self {
            subject,
            config,
            state: RwLock::new(LogState {
                entries: VecDeque::new(),
                tail: Index::ZERO,
                pruned_through: Index::ZERO,
                failure: None,
            }),
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Append an event whose index was assigned by the store.
    ///
    /// The index must be strictly greater than the current tail.
    pub fn append(&self, event: Event) -> Result<Index> {
        if event.topic != self.subject.topic || event.key != self.subject.key {
            return Err(StreamError::WriterAppendFailed(format!(
                "event for {} appended to log of {}",
                event.subject(),
                self.subject
            )));
        }

        let mut state = self.state.write();

        if let Some(reason) = &state.failure {
            return Err(StreamError::WriterAppendFailed(reason.clone()));
        }

        if event.index <= state.tail {
            return Err(StreamError::WriterAppendFailed(format!(
                "index {} is not after tail {}",
                event.index, state.tail
            )));
        }

        let index = event.index;
        state.tail = index;
        state.entries.push_back(event);

        // Capacity overflow drops the oldest entry regardless of readers.
        while state.entries.len() > self.config.max_retained {
            if let Some(evicted) = state.entries.pop_front() {
                state.pruned_through = evicted.index;
                debug!(
                    subject = %self.subject,
                    evicted = evicted.index.0,
                    "mutation log over capacity, evicted oldest entry"
                );
            }
        }

        Ok(index)
    }

    /// Index of the most recent append, or zero for an empty log.
    pub fn tail(&self) -> Index {
        self.state.read().tail
    }

    /// Highest index no longer retained.
    pub fn pruned_through(&self) -> Index {
        self.state.read().pruned_through
    }

    /// Index of the oldest retained entry.
    pub fn oldest_retained(&self) -> Option<Index> {
        self.state.read().entries.front().map(|e| e.index)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a reader at `after` can continue without a gap.
    pub fn can_resume_from(&self, after: Index) -> bool {
        let state = self.state.read();
        state.failure.is_none() && after >= state.pruned_through && after <= state.tail
    }

    /// Read up to `limit` events with index strictly greater than `after`.
    ///
    /// Fails with `CursorTooOld` when entries after `after` have already
    /// been removed.
    pub fn read_after(&self, after: Index, limit: usize) -> Result<Vec<Event>> {
        let state = self.state.read();

        if let Some(reason) = &state.failure {
            return Err(StreamError::WriterAppendFailed(reason.clone()));
        }

        if after < state.pruned_through {
            return Err(StreamError::CursorTooOld {
                oldest: state.pruned_through,
                requested: after,
            });
        }

        let start = state.entries.partition_point(|e| e.index <= after);
        Ok(state
            .entries
            .range(start..)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Start a restartable read of every event after `after`.
    pub fn since(self: &Arc<Self>, after: Index) -> Since {
        Since {
            log: Arc::clone(self),
            cursor: after,
            buffer: VecDeque::new(),
        }
    }

    /// Remove every entry with index at or below `through`.
    ///
    /// Callers pass the lowest cursor among live subscribers, so nothing a
    /// live subscriber still needs is removed. Returns the number removed.
    pub fn prune_through(&self, through: Index) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        while let Some(front) = state.entries.front() {
            if front.index > through {
                break;
            }
            let index = front.index;
            state.entries.pop_front();
            state.pruned_through = index;
            removed += 1;
        }
        removed
    }

    /// Poison the log. Every later append and read fails.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(subject = %self.subject, %reason, "mutation log failed");
        let mut state = self.state.write();
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
    }

    /// The failure that poisoned this log, if any.
    pub fn failure(&self) -> Option<String> {
        self.state.read().failure.clone()
    }
}

/// Cursor over a mutation log yielding every event after a starting index.
///
/// Dropping it and calling [`MutationLog::since`] again with the last
/// delivered index resumes exactly where it left off.
pub struct Since {
    log: Arc<MutationLog>,
    cursor: Index,
    buffer: VecDeque<Event>,
}

impl Since {
    /// Index of the last event handed out (or the starting index).
    pub fn cursor(&self) -> Index {
        self.cursor
    }

    /// Next event if one is already in the log.
    pub fn try_next(&mut self) -> Result<Option<Event>> {
        if self.buffer.is_empty() {
            let batch = self
                .log
                .read_after(self.cursor, self.log.config.read_batch.max(1))?;
            self.buffer.extend(batch);
        }

        match self.buffer.pop_front() {
            Some(event) => {
                self.cursor = event.index;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Next event, suspending on `waiter` while the reader is caught up.
    ///
    /// Cancellation is checked before every read, so it wins over data
    /// that arrived at the same time.
    pub fn next_blocking(&mut self, waiter: &Waiter) -> Result<Event> {
        loop {
            waiter.check()?;
            if let Some(event) = self.try_next()? {
                return Ok(event);
            }
            waiter.wait()?;
        }
    }
}
