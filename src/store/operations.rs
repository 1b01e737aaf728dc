//! Mutation application.

use crate::error::{Result, StreamError};
use crate::types::{Event, EventKind, Index, Payload, Subject};
use std::collections::BTreeMap;

/// A write against one subject of the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Create or replace the entry identified by the payload.
    Upsert(Payload),
    /// Remove an entry by id.
    Delete { entry: String },
}

impl Mutation {
    pub fn delete(entry: impl Into<String>) -> Self {
        Mutation::Delete {
            entry: entry.into(),
        }
    }
}

/// Apply a mutation to a subject's entries and build the event it produces.
///
/// Deleting a missing entry fails and leaves the entries untouched.
pub fn apply_mutation(
    entries: &mut BTreeMap<String, Payload>,
    subject: &Subject,
    index: Index,
    mutation: Mutation,
) -> Result<Event> {
    match mutation {
        Mutation::Upsert(payload) => {
            entries.insert(payload.entry_id(), payload.clone());
            Ok(Event::upsert(subject, index, payload))
        }

        Mutation::Delete { entry } => {
            let previous = entries
                .remove(&entry)
                .ok_or_else(|| StreamError::EntryNotFound(entry.clone()))?;
            Ok(Event::delete(subject, index, previous))
        }
    }
}

/// Re-apply a logged event to a subject's entries.
///
/// Used on journal replay. Deletes of missing entries are ignored and
/// marker events carry no state.
pub fn replay_event(entries: &mut BTreeMap<String, Payload>, event: &Event) {
    match (event.kind, &event.payload) {
        (EventKind::Upsert, Some(payload)) => {
            entries.insert(payload.entry_id(), payload.clone());
        }
        (EventKind::Delete, Some(payload)) => {
            entries.remove(&payload.entry_id());
        }
        _ => {}
    }
}
