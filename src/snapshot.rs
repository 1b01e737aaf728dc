//! Snapshot materialization.
//!
//! A snapshot is the current state of a subject expressed as synthetic
//! upsert events, followed by an `EndOfSnapshot` marker. Every event in it
//! carries the snapshot index, and the stream that follows starts strictly
//! after that index.

use crate::error::{Result, StreamError};
use crate::store::SnapshotSource;
use crate::types::{Event, Index, Subject};
use std::sync::Arc;
use tracing::debug;

/// A materialized snapshot ready for delivery.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub subject: Subject,
    /// Every commit at or below this index is reflected; none above it.
    pub index: Index,
    /// Upserts for each entry, then the `EndOfSnapshot` marker.
    pub events: Vec<Event>,
}

impl Snapshot {
    /// Number of entry events (excluding the marker).
    pub fn entry_count(&self) -> usize {
        self.events.len().saturating_sub(1)
    }
}

/// Builds snapshots from the store's point-in-time read.
pub struct SnapshotMaterializer {
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotMaterializer {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self { source }
    }

    /// Materialize the current state of `subject`.
    ///
    /// The index and the entries come from one atomic read of the store, so
    /// a write racing with this call is either fully inside the snapshot
    /// (and its index is at or below the snapshot index) or fully after it.
    pub fn materialize(&self, subject: &Subject) -> Result<Snapshot> {
        let view = self.source.read_snapshot(subject).map_err(|e| match e {
            StreamError::SnapshotMaterializationFailed(_) => e,
            other => StreamError::SnapshotMaterializationFailed(other.to_string()),
        })?;

        let mut events = Vec::with_capacity(view.entries.len() + 1);
        for payload in view.entries {
            events.push(Event::upsert(subject, view.index, payload));
        }
        events.push(Event::end_of_snapshot(subject, view.index));

        debug!(
            subject = %subject,
            index = view.index.0,
            entries = events.len() - 1,
            "snapshot materialized"
        );

        Ok(Snapshot {
            subject: subject.clone(),
            index: view.index,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Mutation, StateStore, StoreSnapshot};
    use crate::types::{CheckServiceNode, EventKind, Node, NodeService, Payload, Topic};

    fn redis(id: &str, port: u32) -> Payload {
        Payload::ServiceHealth(CheckServiceNode {
            node: Node {
                name: "node1".to_string(),
                address: "3.4.5.6".to_string(),
                datacenter: "dc1".to_string(),
            },
            service: NodeService {
                id: id.to_string(),
                service: "redis".to_string(),
                address: "3.4.5.6".to_string(),
                port,
                tags: vec![],
            },
            checks: vec![],
        })
    }

    struct BrokenSource;

    impl SnapshotSource for BrokenSource {
        fn read_snapshot(&self, _subject: &Subject) -> Result<StoreSnapshot> {
            Err(StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store unavailable",
            )))
        }
    }

    #[test]
    fn test_snapshot_ends_with_marker() {
        let store = Arc::new(StateStore::new());
        let subject = Subject::new(Topic::ServiceHealth, "redis");
        store.commit(&subject, Mutation::Upsert(redis("r1", 1))).unwrap();
        store.commit(&subject, Mutation::Upsert(redis("r2", 2))).unwrap();

        let materializer = SnapshotMaterializer::new(store);
        let snapshot = materializer.materialize(&subject).unwrap();

        assert_eq!(snapshot.index, Index(2));
        assert_eq!(snapshot.entry_count(), 2);
        assert!(snapshot.events[..2].iter().all(|e| e.kind == EventKind::Upsert));
        assert!(snapshot.events.iter().all(|e| e.index == Index(2)));

        let last = snapshot.events.last().unwrap();
        assert!(last.is_end_of_snapshot());
        assert!(last.payload.is_none());
    }

    #[test]
    fn test_empty_subject_still_gets_marker() {
        let materializer = SnapshotMaterializer::new(Arc::new(StateStore::new()));
        let snapshot = materializer
            .materialize(&Subject::new(Topic::ServiceHealth, "nothing"))
            .unwrap();

        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.index, Index::ZERO);
    }

    #[test]
    fn test_store_error_is_materialization_failure() {
        let materializer = SnapshotMaterializer::new(Arc::new(BrokenSource));
        let result = materializer.materialize(&Subject::new(Topic::ServiceHealth, "redis"));
        assert!(matches!(
            result,
            Err(StreamError::SnapshotMaterializationFailed(_))
        ));
    }
}
