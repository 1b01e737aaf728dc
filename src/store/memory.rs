//! In-memory state store.

use super::operations::{apply_mutation, replay_event, Mutation};
use super::{SnapshotSource, StoreSnapshot};
use crate::error::{Result, StreamError};
use crate::types::{Event, Index, Payload, Subject};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct PartitionState {
    entries: BTreeMap<String, Payload>,
    /// Index of the last commit to this subject.
    last_index: Index,
}

struct Partition {
    state: RwLock<PartitionState>,
}

/// The authoritative state, partitioned by subject.
///
/// Commits to one subject are applied under that subject's write lock
/// together with index assignment, and snapshots read the entries and the
/// index under the read lock. A snapshot therefore always reflects exactly
/// the commits up to its index.
pub struct StateStore {
    partitions: RwLock<HashMap<Subject, Arc<Partition>>>,
    /// Highest index handed out by any commit.
    last_index: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            last_index: AtomicU64::new(0),
        }
    }

    /// Apply a mutation, assigning it the next store index.
    ///
    /// Returns the resulting event. Nothing is assigned or changed when the
    /// mutation is rejected.
    pub fn commit(&self, subject: &Subject, mutation: Mutation) -> Result<Event> {
        let partition = self.partition(subject);
        let mut state = partition.state.write();

        if let Mutation::Delete { entry } = &mutation {
            if !state.entries.contains_key(entry) {
                return Err(StreamError::EntryNotFound(entry.clone()));
            }
        }

        let index = Index(self.last_index.fetch_add(1, Ordering::SeqCst) + 1);
        let event = apply_mutation(&mut state.entries, subject, index, mutation)?;
        state.last_index = index;

        Ok(event)
    }

    /// Re-apply an event recovered from the journal at its original index.
    pub fn restore(&self, event: &Event) {
        let subject = event.subject();
        let partition = self.partition(&subject);
        let mut state = partition.state.write();

        replay_event(&mut state.entries, event);
        if event.index > state.last_index {
            state.last_index = event.index;
        }
        self.last_index.fetch_max(event.index.0, Ordering::SeqCst);
    }

    /// Highest index assigned so far.
    pub fn last_index(&self) -> Index {
        Index(self.last_index.load(Ordering::SeqCst))
    }

    /// Current value of one entry.
    pub fn get(&self, subject: &Subject, entry: &str) -> Option<Payload> {
        let partitions = self.partitions.read();
        let partition = partitions.get(subject)?;
        let state = partition.state.read();
        state.entries.get(entry).cloned()
    }

    /// Number of entries in a subject.
    pub fn entry_count(&self, subject: &Subject) -> usize {
        self.partitions
            .read()
            .get(subject)
            .map(|p| p.state.read().entries.len())
            .unwrap_or(0)
    }

    fn partition(&self, subject: &Subject) -> Arc<Partition> {
        if let Some(partition) = self.partitions.read().get(subject) {
            return Arc::clone(partition);
        }

        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(subject.clone()).or_insert_with(|| {
            Arc::new(Partition {
                state: RwLock::new(PartitionState {
                    entries: BTreeMap::new(),
                    last_index: Index::ZERO,
                }),
            })
        }))
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for StateStore {
    fn read_snapshot(&self, subject: &Subject) -> Result<StoreSnapshot> {
        let partition = match self.partitions.read().get(subject) {
            Some(p) => Arc::clone(p),
            None => {
                return Ok(StoreSnapshot {
                    index: Index::ZERO,
                    entries: Vec::new(),
                })
            }
        };

        let state = partition.state.read();
        Ok(StoreSnapshot {
            index: state.last_index,
            entries: state.entries.values().cloned().collect(),
        })
    }
}
