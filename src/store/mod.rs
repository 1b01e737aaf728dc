//! State store collaborator.
//!
//! The store is the source of truth: it assigns indices on commit and
//! offers a point-in-time read per subject. The event engine only depends
//! on the [`SnapshotSource`] seam for reads, so alternative stores (or
//! failing ones in tests) can stand in for [`StateStore`].

mod memory;
mod operations;

pub use memory::StateStore;
pub use operations::{apply_mutation, replay_event, Mutation};

use crate::error::Result;
use crate::types::{Index, Payload, Subject};

/// Point-in-time view of one subject.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    /// Index of the last commit reflected in `entries`.
    pub index: Index,
    /// Current entries, ordered by entry id.
    pub entries: Vec<Payload>,
}

/// Point-in-time read API of the state store.
pub trait SnapshotSource: Send + Sync {
    /// Read the entries of `subject` together with the index they are
    /// valid at. Both must come from one atomic view of the store.
    fn read_snapshot(&self, subject: &Subject) -> Result<StoreSnapshot>;
}
